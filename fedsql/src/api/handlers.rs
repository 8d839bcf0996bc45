//! Request handlers for the gateway surface.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use uuid::Uuid;

use crate::AppState;
use crate::engine::QueryResponse;
use crate::errors::{Error, Result};
use crate::tenant::demo_tenant;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub metadata: QueryMetadata,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryMetadata {
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Upper bound on acceptable data age. `0` means live only - never
    /// serve from cache.
    #[serde(default)]
    pub max_staleness_ms: u64,
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /v1/query` - execute a federated SQL statement.
///
/// Requires `X-Tenant-ID` and `Authorization: Bearer <token>`. Tenants
/// without a configuration document fall back to the synthesized demo
/// tenant so the gateway works without any YAML files.
pub async fn execute_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    let tenant_id = header_value(&headers, "x-tenant-id")
        .ok_or_else(|| Error::AuthInvalid {
            message: "Missing X-Tenant-ID header".to_string(),
        })?
        .to_string();
    let token = header_value(&headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| Error::AuthInvalid {
            message: "Missing bearer token".to_string(),
        })?;

    let trace_id = request
        .metadata
        .trace_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // 1. Resolve tenant
    let tenant_cfg = state
        .registry
        .get(&tenant_id)
        .unwrap_or_else(|| std::sync::Arc::new(demo_tenant(&tenant_id)));

    // 2. Authenticate
    let security_ctx = match state.oidc.validate(token, tenant_cfg.clone()).await {
        Ok(ctx) => ctx,
        Err(err) => {
            record_query(&tenant_id, err.status_code());
            return Err(err);
        }
    };

    // 3. Execute
    let start = Instant::now();
    let result = state
        .engine
        .execute_query(
            &request.sql,
            tenant_cfg,
            &security_ctx,
            request.metadata.max_staleness_ms,
        )
        .await;

    match result {
        Ok(mut response) => {
            record_query(&tenant_id, StatusCode::OK);
            metrics::histogram!("fedsql_query_latency_seconds", "tenant_id" => tenant_id)
                .record(start.elapsed().as_secs_f64());
            response.trace_id = Some(trace_id);
            Ok(Json(response))
        }
        Err(err) => {
            record_query(&tenant_id, err.status_code());
            Err(err)
        }
    }
}

fn record_query(tenant_id: &str, status: StatusCode) {
    metrics::counter!(
        "fedsql_queries_total",
        "status" => status.as_u16().to_string(),
        "tenant_id" => tenant_id.to_string(),
    )
    .increment(1);
}

/// `GET /health` - liveness/readiness probe.
///
/// Reports the shared store and the tenant registry; a gateway without its
/// store is degraded (cache and rate limiting are disabled) but alive.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let redis = if state.cache.enabled() {
        if state.cache.ping().await { "ok" } else { "error" }
    } else {
        "disabled"
    };
    let tenants = state.registry.count();

    let healthy = redis != "error";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "checks": {
                "redis": redis,
                "tenants": tenants.to_string(),
            },
        })),
    )
}
