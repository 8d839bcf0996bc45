//! Tenant configuration: value types, the registry that loads and serves
//! them, and the synthesized demo tenant used when no configuration
//! documents are present.

pub mod models;
pub mod registry;

use std::collections::HashMap;

pub use models::{
    AuthType, ClsAction, ClsRule, ConnectorConfig, RlsRule, SecurityContext, TableBinding,
    TenantConfig, Transport,
};
pub use registry::TenantRegistry;

/// Synthesize a demo tenant backed by the mock connectors.
///
/// Used as the fallback when a request names a tenant with no configuration
/// document, so the gateway works out of the box without any YAML files.
pub fn demo_tenant(tenant_id: &str) -> TenantConfig {
    let mut connector_configs = HashMap::new();
    connector_configs.insert("github".to_string(), {
        let mut cfg = ConnectorConfig::mock("github");
        cfg.freshness_ttl_ms = 30_000;
        cfg.pushable_filters = vec!["status".into(), "team_id".into(), "author".into()];
        cfg
    });
    connector_configs.insert("jira".to_string(), {
        let mut cfg = ConnectorConfig::mock("jira");
        cfg.auth_type = AuthType::Basic;
        cfg.pushable_filters = vec!["status".into(), "project".into(), "priority".into()];
        cfg
    });
    connector_configs.insert("linear".to_string(), {
        let mut cfg = ConnectorConfig::mock("linear");
        cfg.rate_limit_refill_rate = 0.5;
        cfg.pushable_filters = vec!["status".into()];
        cfg
    });

    let mut table_registry = HashMap::new();
    table_registry.insert(
        "github.pull_requests".to_string(),
        TableBinding {
            connector: "github".to_string(),
            fetch_key: "all_prs".to_string(),
        },
    );
    table_registry.insert(
        "jira.issues".to_string(),
        TableBinding {
            connector: "jira".to_string(),
            fetch_key: "all_issues".to_string(),
        },
    );
    table_registry.insert(
        "linear.issues".to_string(),
        TableBinding {
            connector: "linear".to_string(),
            fetch_key: "all_issues".to_string(),
        },
    );

    TenantConfig {
        tenant_id: tenant_id.to_string(),
        display_name: format!("Demo Tenant ({tenant_id})"),
        api_budget: 1000,
        opa_policy_namespace: String::new(),
        connector_configs,
        rls_rules: vec![
            RlsRule {
                connector_id: "github".to_string(),
                rule_expr: "team_id == user.team_id".to_string(),
            },
            RlsRule {
                connector_id: "jira".to_string(),
                rule_expr: "project.lower() == user.team_id".to_string(),
            },
        ],
        cls_rules: vec![
            ClsRule {
                connector_id: "github".to_string(),
                column: "author_email".to_string(),
                action: ClsAction::HashHmac,
                condition: Some("user.pii_access == false".to_string()),
            },
            ClsRule {
                connector_id: "github".to_string(),
                column: "author".to_string(),
                action: ClsAction::Block,
                condition: Some("user.role == \"qa\"".to_string()),
            },
        ],
        table_registry,
    }
}
