//! Tenant configuration value types.
//!
//! These are plain data with no behaviour so both the security layer and the
//! connectors can depend on them without cycles. A [`TenantConfig`] is an
//! immutable snapshot once loaded; the registry replaces whole snapshots,
//! never mutates them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Bearer,
    Basic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Rest,
    Graphql,
}

/// Per-connector configuration scoped to a single tenant.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    pub connector_id: String,
    pub base_url: String,
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    /// `env://VAR_NAME` indirection, or a literal secret for dev
    #[serde(default)]
    pub credential_ref: String,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    /// Appended to `base_url` for GraphQL requests
    #[serde(default = "default_graphql_path")]
    pub graphql_path: String,
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: u32,
    /// Tokens per second
    #[serde(default = "default_rate_limit_refill_rate")]
    pub rate_limit_refill_rate: f64,
    #[serde(default = "default_freshness_ttl_ms")]
    pub freshness_ttl_ms: u64,
    /// Fields this connector can filter server-side. Predicates on other
    /// fields stay in the join engine.
    #[serde(default)]
    pub pushable_filters: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Connector-specific settings (e.g. GitHub owner/repo, generic
    /// connector manifests)
    #[serde(default)]
    pub extra_params: HashMap<String, serde_json::Value>,
}

fn default_auth_type() -> AuthType {
    AuthType::Bearer
}
fn default_transport() -> Transport {
    Transport::Rest
}
fn default_graphql_path() -> String {
    "/graphql".to_string()
}
fn default_rate_limit_capacity() -> u32 {
    50
}
fn default_rate_limit_refill_rate() -> f64 {
    10.0
}
fn default_freshness_ttl_ms() -> u64 {
    60_000
}
fn default_page_size() -> u32 {
    100
}

impl ConnectorConfig {
    /// A mock connector configuration for demo mode and tests.
    pub fn mock(connector_id: &str) -> Self {
        Self {
            connector_id: connector_id.to_string(),
            base_url: "mock".to_string(),
            auth_type: AuthType::Bearer,
            credential_ref: String::new(),
            transport: Transport::Rest,
            graphql_path: default_graphql_path(),
            rate_limit_capacity: 50,
            rate_limit_refill_rate: 10.0,
            freshness_ttl_ms: 60_000,
            pushable_filters: vec![
                "status".into(),
                "team_id".into(),
                "project".into(),
                "priority".into(),
            ],
            page_size: 100,
            extra_params: HashMap::new(),
        }
    }
}

/// Row-level security rule.
///
/// `rule_expr` is a restricted comparison over row fields and user context,
/// e.g. `team_id == user.team_id` or `project.lower() == user.team_id`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RlsRule {
    pub connector_id: String,
    pub rule_expr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClsAction {
    HashHmac,
    Block,
    Redact,
}

/// Column-level security rule for masking or blocking a field.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClsRule {
    pub connector_id: String,
    pub column: String,
    pub action: ClsAction,
    /// Guard expression evaluated against user context; `None` means the
    /// rule always applies.
    #[serde(default)]
    pub condition: Option<String>,
}

/// Binds a dotted virtual table name to a connector and fetch key.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TableBinding {
    pub connector: String,
    #[serde(default = "default_fetch_key")]
    pub fetch_key: String,
}

fn default_fetch_key() -> String {
    "all".to_string()
}

/// Complete, validated configuration for a single tenant.
///
/// Every subsystem (cache, rate limiter, security enforcer) scopes its
/// operations to `tenant_id`, so no cross-tenant data leakage is possible
/// even on shared infrastructure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub display_name: String,

    /// Global API call budget across all connectors (calls/minute)
    #[serde(default = "default_api_budget")]
    pub api_budget: u32,

    /// OPA policy namespace prefix. Empty selects inline rule evaluation.
    #[serde(default)]
    pub opa_policy_namespace: String,

    pub connector_configs: HashMap<String, ConnectorConfig>,
    #[serde(default)]
    pub rls_rules: Vec<RlsRule>,
    #[serde(default)]
    pub cls_rules: Vec<ClsRule>,

    /// Maps dotted SQL table names to connectors,
    /// e.g. `"github.pull_requests" -> {connector: github, fetch_key: all_prs}`
    #[serde(default)]
    pub table_registry: HashMap<String, TableBinding>,
}

fn default_api_budget() -> u32 {
    1000
}

impl TenantConfig {
    /// Sorted list of virtual table names this tenant can query, for error
    /// messages.
    pub fn available_tables(&self) -> String {
        let mut names: Vec<&str> = self.table_registry.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }
}

/// Immutable, request-scoped security context.
///
/// Created once per request by token validation and threaded as an explicit
/// parameter through every downstream call.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub user_id: String,
    pub email: String,
    pub role: String,
    pub team_id: String,
    pub pii_access: bool,
    pub tenant_id: String,
    pub tenant_cfg: Arc<TenantConfig>,
}

impl SecurityContext {
    /// Resolve a `user.<attr>` reference from a policy expression.
    pub fn attr(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "user_id" => Some(serde_json::Value::String(self.user_id.clone())),
            "email" => Some(serde_json::Value::String(self.email.clone())),
            "role" => Some(serde_json::Value::String(self.role.clone())),
            "team_id" => Some(serde_json::Value::String(self.team_id.clone())),
            "pii_access" => Some(serde_json::Value::Bool(self.pii_access)),
            _ => None,
        }
    }
}
