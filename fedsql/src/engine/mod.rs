//! The federated engine: the per-request pipeline.
//!
//! ```text
//! plan -> parallel fetch (DAG waves, hard barrier) -> RLS/CLS ->
//! register views -> execute rewritten SQL -> assemble response
//! ```
//!
//! Nothing is shared across requests except the connector map (which owns
//! the pooled HTTP transports) and the cache handle. The join-engine
//! connection is per-request and confined to a blocking task; fan-out
//! latency is the slowest source in a wave, not the sum.

mod join;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::cache::{CacheStats, RedisCache};
use crate::connectors::SourceConnector;
use crate::errors::{Error, Result};
use crate::governance::RateLimitStatus;
use crate::planner::{ExecutionDag, FetchNode, QueryPlanner};
use crate::security::{apply_cls, apply_rls};
use crate::tenant::models::{SecurityContext, TenantConfig};
use crate::types::Row;

pub use join::ViewData;

/// Per-connector timing recorded during DAG execution.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorTiming {
    pub fetch_ms: u64,
    pub from_cache: bool,
    pub rows: usize,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingBreakdown {
    pub total_ms: u64,
    pub planning_ms: u64,
    pub fetch_ms: u64,
    pub security_ms: u64,
    pub join_ms: u64,
}

/// Successful query response, serialized verbatim to the caller.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    /// Worst-case staleness across all sources: the maximum of each node's
    /// observed cache age or fetch latency.
    pub freshness_ms: u64,
    pub rate_limit_status: RateLimitStatus,
    pub cache_stats: CacheStats,
    /// True only when every node was served from cache
    pub from_cache: bool,
    pub connector_timings: BTreeMap<String, ConnectorTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    pub timing: TimingBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Result of one fetch node, keyed by view name.
struct NodeResult {
    data: Vec<Row>,
    connector_id: String,
    freshness_ms: u64,
    from_cache: bool,
    stale: bool,
    rate_limit_status: RateLimitStatus,
}

pub struct FederatedEngine {
    connectors: HashMap<String, Arc<SourceConnector>>,
    cache: Arc<RedisCache>,
}

impl FederatedEngine {
    pub fn new(
        connectors: HashMap<String, Arc<SourceConnector>>,
        cache: Arc<RedisCache>,
    ) -> Self {
        Self { connectors, cache }
    }

    /// Run the full pipeline for one SQL statement.
    #[tracing::instrument(skip_all, fields(tenant_id = %tenant_cfg.tenant_id, user_id = %security_ctx.user_id))]
    pub async fn execute_query(
        &self,
        sql: &str,
        tenant_cfg: Arc<TenantConfig>,
        security_ctx: &SecurityContext,
        max_staleness_ms: u64,
    ) -> Result<QueryResponse> {
        let mut warnings: Vec<String> = Vec::new();
        let mut connector_timings: BTreeMap<String, ConnectorTiming> = BTreeMap::new();

        // 1. Plan
        let plan_start = Instant::now();
        let planner = QueryPlanner::new(tenant_cfg.clone());
        let dag = planner.plan(sql)?;
        let planning_ms = plan_start.elapsed().as_millis() as u64;

        // 2. Execute DAG
        let fetch_start = Instant::now();
        let node_results = self
            .execute_dag(&dag, &tenant_cfg, max_staleness_ms, &mut connector_timings)
            .await?;
        let fetch_ms = fetch_start.elapsed().as_millis() as u64;

        // 3. RLS + CLS per view, before the join engine sees any data
        let security_start = Instant::now();
        let mut views: BTreeMap<String, ViewData> = BTreeMap::new();
        let mut freshness_ms: u64 = 0;
        let mut rate_limit_status = RateLimitStatus::default();
        let mut all_from_cache = true;

        for (view_name, result) in node_results {
            freshness_ms = freshness_ms.max(result.freshness_ms);
            rate_limit_status = result.rate_limit_status;
            all_from_cache = all_from_cache && result.from_cache;
            if result.stale {
                push_warning(&mut warnings, "STALE_DATA");
            }

            let raw_count = result.data.len();
            let exemplar = result.data.first().cloned();
            let secured = apply_rls(&result.connector_id, &result.data, security_ctx);
            let secured = apply_cls(&result.connector_id, &secured, security_ctx);

            // RLS filtered a non-empty source down to nothing
            if raw_count > 0 && secured.is_empty() {
                push_warning(&mut warnings, "ENTITLEMENT_DENIED");
            }

            views.insert(
                view_name,
                ViewData {
                    rows: secured,
                    exemplar,
                },
            );
        }
        let security_ms = security_start.elapsed().as_millis() as u64;

        // 4. Per-request join engine; the connection lives and dies inside
        // the blocking task
        let join_start = Instant::now();
        let rewritten_sql = dag.rewritten_sql.clone();
        let (rows, columns) = tokio::task::spawn_blocking(move || {
            join::run_join(&rewritten_sql, &views)
        })
        .await
        .map_err(|e| Error::Internal {
            operation: format!("run join task: {e}"),
        })??;
        let join_ms = join_start.elapsed().as_millis() as u64;

        // 5. Response assembly
        let total_ms = planning_ms + fetch_ms + security_ms + join_ms;
        debug!(
            rows = rows.len(),
            total_ms, planning_ms, fetch_ms, security_ms, join_ms, "Query complete"
        );

        let cache_stats = self.cache.stats(&tenant_cfg.tenant_id).await;

        Ok(QueryResponse {
            rows,
            columns,
            freshness_ms,
            rate_limit_status,
            cache_stats,
            from_cache: all_from_cache,
            connector_timings,
            warnings: if warnings.is_empty() {
                None
            } else {
                Some(warnings)
            },
            timing: TimingBreakdown {
                total_ms,
                planning_ms,
                fetch_ms,
                security_ms,
                join_ms,
            },
            trace_id: None,
        })
    }

    /// Execute the DAG wave by wave.
    ///
    /// Every node in a wave is spawned concurrently; the wave then forms a
    /// hard barrier - no node of the next wave starts before every node of
    /// this one finished. The first failure wins and still-running siblings
    /// get a best-effort abort.
    async fn execute_dag(
        &self,
        dag: &ExecutionDag,
        tenant_cfg: &Arc<TenantConfig>,
        max_staleness_ms: u64,
        connector_timings: &mut BTreeMap<String, ConnectorTiming>,
    ) -> Result<BTreeMap<String, NodeResult>> {
        let waves = dag.waves()?;
        info!(
            nodes = dag.nodes.len(),
            waves = waves.len(),
            "Executing fetch graph"
        );

        let mut all_results = BTreeMap::new();
        for wave in waves {
            let mut tasks: JoinSet<Result<(String, NodeResult, u64)>> = JoinSet::new();
            for node in wave {
                tasks.spawn(self.node_task(node, tenant_cfg, max_staleness_ms)?);
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok((view_name, result, node_ms))) => {
                        connector_timings.insert(
                            result.connector_id.clone(),
                            ConnectorTiming {
                                fetch_ms: node_ms,
                                from_cache: result.from_cache,
                                rows: result.data.len(),
                                stale: result.stale,
                            },
                        );
                        all_results.insert(view_name, result);
                    }
                    Ok(Err(err)) => {
                        tasks.abort_all();
                        return Err(err);
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(join_err) => {
                        tasks.abort_all();
                        return Err(Error::Internal {
                            operation: format!("join fetch task: {join_err}"),
                        });
                    }
                }
            }
        }

        Ok(all_results)
    }

    /// Build the future for one fetch node.
    fn node_task(
        &self,
        node: FetchNode,
        tenant_cfg: &Arc<TenantConfig>,
        max_staleness_ms: u64,
    ) -> Result<impl std::future::Future<Output = Result<(String, NodeResult, u64)>> + Send + 'static>
    {
        let connector = self
            .connectors
            .get(&node.connector_id)
            .cloned()
            .ok_or_else(|| Error::Internal {
                operation: format!(
                    "resolve connector '{}' for tenant '{}'",
                    node.connector_id, tenant_cfg.tenant_id
                ),
            })?;
        // Rate-limit capacity, refill and TTL always come from the
        // requesting tenant's configuration.
        let cfg = tenant_cfg
            .connector_configs
            .get(&node.connector_id)
            .cloned()
            .unwrap_or_else(|| connector.config().clone());
        let tenant_id = tenant_cfg.tenant_id.clone();

        Ok(async move {
            let node_start = Instant::now();
            let outcome = connector
                .get_data(
                    &tenant_id,
                    &cfg,
                    &node.fetch_key,
                    max_staleness_ms,
                    &node.pushdown_filters,
                )
                .await?;
            let node_ms = node_start.elapsed().as_millis() as u64;

            Ok((
                node.view_name,
                NodeResult {
                    data: outcome.data,
                    connector_id: node.connector_id,
                    freshness_ms: outcome.freshness_ms,
                    from_cache: outcome.from_cache,
                    stale: outcome.stale,
                    rate_limit_status: outcome.rate_limit_status,
                },
                node_ms,
            ))
        })
    }
}

fn push_warning(warnings: &mut Vec<String>, warning: &str) {
    if !warnings.iter().any(|w| w == warning) {
        warnings.push(warning.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::build_connectors;
    use crate::governance::RateLimiter;
    use crate::security::OidcValidator;
    use crate::tenant::demo_tenant;
    use crate::tenant::models::ConnectorConfig;
    use serde_json::json;

    fn test_engine() -> FederatedEngine {
        let cache = Arc::new(RedisCache::new(None));
        let limiter = Arc::new(RateLimiter::new(None));
        let mut configs = HashMap::new();
        for id in ["github", "jira", "linear"] {
            configs.insert(id.to_string(), ConnectorConfig::mock(id));
        }
        let connectors =
            build_connectors(&configs, cache.clone(), limiter, reqwest::Client::new());
        FederatedEngine::new(connectors, cache)
    }

    async fn ctx(token: &str) -> (Arc<TenantConfig>, SecurityContext) {
        let tenant = Arc::new(demo_tenant("test"));
        let validator = OidcValidator::new("", "test");
        let ctx = validator
            .validate(token, tenant.clone())
            .await
            .expect("dev token");
        (tenant, ctx)
    }

    #[tokio::test]
    async fn simple_github_query() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let response = engine
            .execute_query(
                "SELECT pr_id, team_id, status FROM github.pull_requests LIMIT 5",
                tenant,
                &ctx,
                5000,
            )
            .await
            .expect("query succeeds");
        assert_eq!(response.rows.len(), 5);
        assert!(response.columns.contains(&"pr_id".to_string()));
        assert!(!response.from_cache);
        assert!(response.connector_timings.contains_key("github"));
    }

    #[tokio::test]
    async fn simple_jira_query() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let response = engine
            .execute_query(
                "SELECT issue_key, status FROM jira.issues LIMIT 3",
                tenant,
                &ctx,
                5000,
            )
            .await
            .expect("query succeeds");
        assert_eq!(response.rows.len(), 3);
    }

    #[tokio::test]
    async fn predicate_pushdown_filters_rows() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let response = engine
            .execute_query(
                "SELECT pr_id, status FROM github.pull_requests WHERE status = 'merged'",
                tenant,
                &ctx,
                5000,
            )
            .await
            .expect("query succeeds");
        assert!(!response.rows.is_empty());
        assert!(response.rows.iter().all(|r| r["status"] == json!("merged")));
    }

    #[tokio::test]
    async fn cross_source_join() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let response = engine
            .execute_query(
                "SELECT gh.pr_id, ji.issue_key \
                 FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name",
                tenant,
                &ctx,
                5000,
            )
            .await
            .expect("join succeeds");
        assert!(!response.rows.is_empty());
        assert_eq!(response.columns, vec!["pr_id", "issue_key"]);
    }

    #[tokio::test]
    async fn join_with_where_on_one_table() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let response = engine
            .execute_query(
                "SELECT gh.pr_id, gh.status, ji.issue_key \
                 FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name \
                 WHERE gh.status = 'merged'",
                tenant,
                &ctx,
                5000,
            )
            .await
            .expect("join succeeds");
        assert!(response.rows.iter().all(|r| r["status"] == json!("merged")));
    }

    #[tokio::test]
    async fn rls_isolates_teams() {
        let engine = test_engine();

        let (tenant, mobile_ctx) = ctx("token_dev").await;
        let mobile = engine
            .execute_query(
                "SELECT pr_id, team_id FROM github.pull_requests",
                tenant,
                &mobile_ctx,
                5000,
            )
            .await
            .expect("mobile query");
        let teams: std::collections::HashSet<String> = mobile
            .rows
            .iter()
            .map(|r| r["team_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(teams, std::collections::HashSet::from(["mobile".to_string()]));

        let (tenant, web_ctx) = ctx("token_web_dev").await;
        let web = engine
            .execute_query(
                "SELECT pr_id, team_id FROM github.pull_requests",
                tenant,
                &web_ctx,
                5000,
            )
            .await
            .expect("web query");
        let web_ids: std::collections::HashSet<&str> = web
            .rows
            .iter()
            .map(|r| r["pr_id"].as_str().unwrap())
            .collect();
        for row in &mobile.rows {
            assert!(!web_ids.contains(row["pr_id"].as_str().unwrap()));
        }
    }

    #[tokio::test]
    async fn cls_masks_for_qa() {
        let engine = test_engine();
        let (tenant, qa_ctx) = ctx("token_qa").await;
        let response = engine
            .execute_query(
                "SELECT author, author_email FROM github.pull_requests LIMIT 3",
                tenant,
                &qa_ctx,
                5000,
            )
            .await
            .expect("qa query");
        assert_eq!(response.rows.len(), 3);
        for row in &response.rows {
            assert_eq!(row["author"], json!("[HIDDEN]"));
            assert!(row["author_email"].as_str().unwrap().ends_with("****@ema.co"));
        }
    }

    #[tokio::test]
    async fn rls_wipeout_yields_entitlement_warning_and_empty_join() {
        let engine = test_engine();
        let mut tenant = demo_tenant("test");
        // No row carries a team_id equal to a role, so RLS filters all rows.
        tenant.rls_rules = vec![crate::tenant::models::RlsRule {
            connector_id: "github".to_string(),
            rule_expr: "team_id == user.role".to_string(),
        }];
        let tenant = Arc::new(tenant);
        let validator = OidcValidator::new("", "test");
        let ctx = validator
            .validate("token_dev", tenant.clone())
            .await
            .expect("dev token");

        let response = engine
            .execute_query(
                "SELECT pr_id, team_id FROM github.pull_requests",
                tenant,
                &ctx,
                5000,
            )
            .await
            .expect("empty result still joins");
        assert!(response.rows.is_empty());
        assert_eq!(response.columns, vec!["pr_id", "team_id"]);
        assert_eq!(
            response.warnings,
            Some(vec!["ENTITLEMENT_DENIED".to_string()])
        );
    }

    #[tokio::test]
    async fn unknown_table_is_a_client_error() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let err = engine
            .execute_query("SELECT * FROM nonexistent.table", tenant, &ctx, 0)
            .await
            .expect_err("unknown table");
        assert!(matches!(err, Error::NoRecognizedTables { .. }));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn syntax_error_is_a_client_error() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let err = engine
            .execute_query("SELECTTTT * FROMM github.pull_requests", tenant, &ctx, 0)
            .await
            .expect_err("bad sql");
        assert!(matches!(err, Error::InvalidSql { .. }));
    }

    #[tokio::test]
    async fn response_carries_metadata() {
        let engine = test_engine();
        let (tenant, ctx) = ctx("token_dev").await;
        let response = engine
            .execute_query(
                "SELECT pr_id FROM github.pull_requests LIMIT 1",
                tenant,
                &ctx,
                5000,
            )
            .await
            .expect("query succeeds");
        assert_eq!(response.rate_limit_status.capacity, 50);
        assert!(!response.cache_stats.enabled);
        assert_eq!(
            response.timing.total_ms,
            response.timing.planning_ms
                + response.timing.fetch_ms
                + response.timing.security_ms
                + response.timing.join_ms
        );
        let timing = &response.connector_timings["github"];
        assert!(!timing.from_cache);
        assert!(timing.rows > 0);
    }
}
