//! # fedsql: a multi-tenant federated SQL gateway
//!
//! Clients submit a single SQL statement that logically joins tables served
//! by disparate SaaS APIs (issue trackers, source control, ticketing). The
//! gateway parses the SQL, fans out concurrent fetches to the relevant
//! connectors, enforces row- and column-level security per tenant policy,
//! joins the resulting row-sets in an embedded SQL engine, and returns rows
//! plus rich metadata: freshness, cache status, per-connector timings,
//! rate-limit budget and warnings.
//!
//! ## Request flow
//!
//! A `POST /v1/query` request resolves its tenant from the `X-Tenant-ID`
//! header and validates the bearer token, then hands off to the federated
//! engine:
//!
//! 1. The [`planner`] parses the SQL into an execution DAG - one fetch node
//!    per recognized virtual table, with alias-aware predicate pushdown and
//!    the dotted table names rewritten to the view names the join engine
//!    will see.
//! 2. The engine executes the DAG wave by wave; nodes in a wave run
//!    concurrently and are joined at a hard barrier. Each node goes through
//!    its connector's pipeline: cache lookup, distributed rate-limit
//!    consume (with stale-cache fallback on denial), retried fetch, and
//!    best-effort cache write-back.
//! 3. Row-level and column-level security rules from the tenant
//!    configuration are applied to every fetched row-set before the join
//!    engine sees any data.
//! 4. The secured row-sets are registered in a per-request embedded DuckDB
//!    connection, the rewritten SQL executes, and the response is assembled
//!    with timing and freshness metadata.
//!
//! ## Shared state
//!
//! Cross-request state is deliberately narrow: the tenant registry snapshot
//! (replaced atomically on reload), the pooled HTTP clients inside the
//! connector map, and the shared-store handles used by the cache and the
//! rate limiter. Everything else is request-scoped.

pub mod api;
pub mod cache;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod errors;
pub mod governance;
pub mod planner;
pub mod security;
pub mod telemetry;
pub mod tenant;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, info, warn};

pub use config::Config;
use cache::RedisCache;
use connectors::build_connectors;
use engine::FederatedEngine;
use governance::RateLimiter;
use security::OidcValidator;
use tenant::models::ConnectorConfig;
use tenant::{TenantRegistry, demo_tenant};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<TenantRegistry>,
    pub engine: Arc<FederatedEngine>,
    pub cache: Arc<RedisCache>,
    pub limiter: Arc<RateLimiter>,
    pub oidc: Arc<OidcValidator>,
}

/// Build the application router with all endpoints and middleware.
pub fn build_router(state: AppState) -> Router {
    let enable_metrics = state.config.enable_metrics;

    let mut router = Router::new()
        .route("/v1/query", post(api::handlers::execute_query))
        .route("/health", get(api::handlers::health))
        .with_state(state);

    if enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/metrics", get(move || async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    router.layer(CorsLayer::permissive()).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] loads tenant configs, connects to the
///    shared store (degrading gracefully when it is unreachable), and builds
///    the connector map and engine.
/// 2. **Serve**: [`Application::serve`] binds the listener and handles
///    requests until the shutdown future resolves.
pub struct Application {
    router: Router,
    state: AppState,
    config: Config,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        // Tenant registry: an empty or missing config dir is not fatal -
        // unknown tenants fall back to the demo tenant.
        let registry = Arc::new(TenantRegistry::new(config.tenant_config_dir.clone()));
        match registry.load_all() {
            Ok(count) => info!("Loaded {count} tenant config(s)"),
            Err(e) => warn!("No tenant configs loaded: {e}"),
        }

        // Shared store, with graceful fallback for local dev without Redis
        let redis_conn = match &config.redis_url {
            Some(url) => match connect_redis(url).await {
                Ok(conn) => {
                    info!("Shared store connected: {url}");
                    Some(conn)
                }
                Err(e) => {
                    warn!("Shared store unavailable ({e}) - cache and rate limiting disabled");
                    None
                }
            },
            None => None,
        };

        let cache = Arc::new(RedisCache::new(redis_conn.clone()));
        let limiter = Arc::new(RateLimiter::new(redis_conn));

        // Connector-level HTTP pool with the fixed per-request timeout
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_secs))
            .build()?;

        let connectors = build_connectors(
            &connector_configs(&registry),
            cache.clone(),
            limiter.clone(),
            http,
        );
        let engine = Arc::new(FederatedEngine::new(connectors, cache.clone()));

        let oidc = Arc::new(OidcValidator::new(
            config.auth.jwks_url.clone(),
            config.auth.audience.clone(),
        ));

        let state = AppState {
            config: config.clone(),
            registry,
            engine,
            cache,
            limiter,
            oidc,
        };
        let router = build_router(state.clone());

        Ok(Self {
            router,
            state,
            config,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The configured router, e.g. for driving the app from a test server.
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve until the shutdown future resolves.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Federated SQL gateway listening on http://{bind_addr} ({} tenant(s) loaded)",
            self.state.registry.count()
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Gateway shut down.");
        Ok(())
    }
}

async fn connect_redis(url: &str) -> anyhow::Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url.to_string())?;
    let conn = client.get_connection_manager().await?;
    Ok(conn)
}

/// The process-wide connector set.
///
/// Connectors are keyed by connector id and own the pooled transports, so
/// the map is built once: each id takes its transport configuration from
/// the first (alphabetically) tenant that defines it, and the demo set
/// fills in when no tenant configs are loaded. Per-request governance
/// settings still come from the requesting tenant.
fn connector_configs(registry: &TenantRegistry) -> HashMap<String, ConnectorConfig> {
    let mut configs: HashMap<String, ConnectorConfig> = HashMap::new();
    let snapshot = registry.snapshot();
    let mut tenant_ids: Vec<&String> = snapshot.keys().collect();
    tenant_ids.sort();
    for tenant_id in tenant_ids {
        if let Some(tenant) = snapshot.get(tenant_id) {
            for (id, cfg) in &tenant.connector_configs {
                configs.entry(id.clone()).or_insert_with(|| cfg.clone());
            }
        }
    }
    if configs.is_empty() {
        configs = demo_tenant("demo").connector_configs;
    }
    configs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    async fn test_application() -> Application {
        let config = Config {
            redis_url: None,
            tenant_config_dir: std::path::PathBuf::from("/nonexistent"),
            enable_metrics: false,
            ..Config::default()
        };
        Application::new(config).await.expect("application builds")
    }

    #[tokio::test]
    async fn query_round_trip_through_http() {
        let app = test_application().await;
        let server = axum_test::TestServer::new(app.into_router()).expect("test server");

        let response = server
            .post("/v1/query")
            .add_header("X-Tenant-ID", "demo")
            .add_header("Authorization", "Bearer token_dev")
            .json(&json!({
                "sql": "SELECT pr_id FROM github.pull_requests LIMIT 5",
                "metadata": {"max_staleness_ms": 5000}
            }))
            .await;
        response.assert_status_ok();

        let body: Value = response.json();
        assert_eq!(body["rows"].as_array().unwrap().len(), 5);
        assert_eq!(body["from_cache"], json!(false));
        assert!(body["trace_id"].is_string());
        assert!(body["connector_timings"]["github"].is_object());
    }

    #[tokio::test]
    async fn invalid_token_is_401() {
        let app = test_application().await;
        let server = axum_test::TestServer::new(app.into_router()).expect("test server");

        let response = server
            .post("/v1/query")
            .add_header("X-Tenant-ID", "demo")
            .add_header("Authorization", "Bearer token_wrong")
            .json(&json!({"sql": "SELECT 1"}))
            .await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_tenant_header_is_401() {
        let app = test_application().await;
        let server = axum_test::TestServer::new(app.into_router()).expect("test server");

        let response = server
            .post("/v1/query")
            .add_header("Authorization", "Bearer token_dev")
            .json(&json!({"sql": "SELECT 1"}))
            .await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_table_is_400_with_available_tables() {
        let app = test_application().await;
        let server = axum_test::TestServer::new(app.into_router()).expect("test server");

        let response = server
            .post("/v1/query")
            .add_header("X-Tenant-ID", "demo")
            .add_header("Authorization", "Bearer token_dev")
            .json(&json!({"sql": "SELECT * FROM salesforce.contacts"}))
            .await;
        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], json!("NO_RECOGNIZED_TABLES"));
        assert!(
            body["message"]
                .as_str()
                .unwrap()
                .contains("github.pull_requests")
        );
    }

    #[tokio::test]
    async fn health_reports_store_and_tenants() {
        let app = test_application().await;
        let server = axum_test::TestServer::new(app.into_router()).expect("test server");

        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["checks"]["redis"], json!("disabled"));
        assert_eq!(body["checks"]["tenants"], json!("0"));
    }
}
