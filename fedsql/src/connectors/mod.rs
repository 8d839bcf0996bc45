//! SaaS source connectors.
//!
//! A connector is split along a trait seam: [`DataSource`] implementations
//! know how to talk to one upstream API (or serve its mock corpus), while
//! [`SourceConnector`] owns the surrounding orchestration that is identical
//! for every source:
//!
//! 1. cache lookup against the caller's staleness budget
//! 2. distributed rate-limit consume, with stale-cache fallback on denial
//! 3. the actual fetch, wrapped in exponential-backoff retry
//! 4. best-effort cache write-back
//!
//! Subclassing in the original design maps onto `Box<dyn DataSource>` here;
//! adding a source means implementing one trait method.

pub mod generic;
pub mod github;
pub mod jira;
pub mod linear;
pub mod transport;

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cache::RedisCache;
use crate::errors::{Error, Result};
use crate::governance::{RateLimitStatus, RateLimiter};
use crate::tenant::models::ConnectorConfig;
use crate::types::{Filters, Row};

/// What a fetch is asked to produce: the canonical endpoint selector plus
/// any server-side filters the planner pushed down.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub fetch_key: String,
    pub filters: Filters,
}

/// Failure of a single fetch attempt, before the retry policy is applied.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("GraphQL error: {0}")]
    Graphql(String),

    #[error("{0}")]
    Invalid(String),
}

impl FetchError {
    /// HTTP status of the failure, when there is one. Transport-level
    /// failures (timeouts, refused connections) have none and are never
    /// retried per-status; they abort the attempt loop.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// One upstream source. Implementations perform the actual REST/GraphQL
/// call (or filter the mock corpus) and normalize records to the canonical
/// row schema.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, ctx: &QueryContext) -> std::result::Result<Vec<Row>, FetchError>;
}

/// Result of [`SourceConnector::get_data`].
#[derive(Debug)]
pub struct FetchOutcome {
    pub data: Vec<Row>,
    /// Observed cache age on a hit, fetch latency on a miss.
    pub freshness_ms: u64,
    pub from_cache: bool,
    /// True when stale data was served because the rate limiter denied a
    /// live fetch.
    pub stale: bool,
    pub rate_limit_status: RateLimitStatus,
}

/// Orchestrates cache, rate limiting, retries and write-back around a
/// [`DataSource`].
pub struct SourceConnector {
    cfg: ConnectorConfig,
    source: Box<dyn DataSource>,
    cache: Arc<RedisCache>,
    limiter: Arc<RateLimiter>,
}

impl SourceConnector {
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

    pub fn new(
        cfg: ConnectorConfig,
        source: Box<dyn DataSource>,
        cache: Arc<RedisCache>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            cfg,
            source,
            cache,
            limiter,
        }
    }

    pub fn connector_id(&self) -> &str {
        &self.cfg.connector_id
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.cfg
    }

    /// Fetch rows for one DAG node.
    ///
    /// `cfg` is the *requesting tenant's* connector configuration: rate
    /// limit capacity, refill rate and cache TTL always come from the
    /// tenant, while the transport stays with this connector instance.
    #[tracing::instrument(skip_all, fields(connector_id = %self.cfg.connector_id, fetch_key))]
    pub async fn get_data(
        &self,
        tenant_id: &str,
        cfg: &ConnectorConfig,
        fetch_key: &str,
        max_staleness_ms: u64,
        filters: &Filters,
    ) -> Result<FetchOutcome> {
        let connector_id = self.cfg.connector_id.clone();

        // 1. Cache check
        if let Some((data, age_ms)) = self
            .cache
            .get(tenant_id, &connector_id, max_staleness_ms, filters)
            .await
        {
            let rate_limit_status = self
                .limiter
                .status(tenant_id, &connector_id, cfg.rate_limit_capacity)
                .await;
            return Ok(FetchOutcome {
                data,
                freshness_ms: age_ms,
                from_cache: true,
                stale: false,
                rate_limit_status,
            });
        }

        // 2. Rate limit check
        let (allowed, remaining) = self
            .limiter
            .consume(
                tenant_id,
                &connector_id,
                cfg.rate_limit_capacity,
                cfg.rate_limit_refill_rate,
                1,
            )
            .await?;
        if !allowed {
            // Stale fallback: any cached data, regardless of age, beats a
            // hard failure. This re-read does not consume budget.
            if let Some((data, age_ms)) = self
                .cache
                .get(tenant_id, &connector_id, u64::MAX, filters)
                .await
            {
                warn!(
                    connector_id,
                    age_ms, "Rate limit exhausted - returning stale data"
                );
                let rate_limit_status = self
                    .limiter
                    .status(tenant_id, &connector_id, cfg.rate_limit_capacity)
                    .await;
                return Ok(FetchOutcome {
                    data,
                    freshness_ms: age_ms,
                    from_cache: true,
                    stale: true,
                    rate_limit_status,
                });
            }
            return Err(Error::RateLimitExhausted {
                connector_id,
                remaining,
            });
        }

        // 3. Fetch with retry
        let ctx = QueryContext {
            fetch_key: fetch_key.to_string(),
            filters: filters.clone(),
        };
        let fetch_start = Instant::now();
        let data = self.fetch_with_retry(&ctx).await?;
        let fetch_ms = fetch_start.elapsed().as_millis() as u64;
        debug!(connector_id, rows = data.len(), fetch_ms, "Fetched from source");

        // 4. Write-back is best-effort: a flaky store must not lose data we
        // already hold.
        if let Err(e) = self
            .cache
            .put(
                tenant_id,
                &connector_id,
                &data,
                cfg.freshness_ttl_ms,
                filters,
                None,
            )
            .await
        {
            warn!("Cache write-back failed for {connector_id}: {e}");
        }

        let rate_limit_status = self
            .limiter
            .status(tenant_id, &connector_id, cfg.rate_limit_capacity)
            .await;
        Ok(FetchOutcome {
            data,
            freshness_ms: fetch_ms,
            from_cache: false,
            stale: false,
            rate_limit_status,
        })
    }

    /// Wrap the source fetch with exponential-backoff retry.
    ///
    /// Retryable statuses get up to [`Self::MAX_RETRIES`] attempts total
    /// with `base * 2^attempt` delays plus up to 10% jitter. Any other HTTP
    /// status is immediately fatal; non-HTTP failures abort the loop and
    /// surface as a timeout.
    async fn fetch_with_retry(&self, ctx: &QueryContext) -> Result<Vec<Row>> {
        for attempt in 0..Self::MAX_RETRIES {
            match self.source.fetch(ctx).await {
                Ok(rows) => return Ok(rows),
                Err(err) => match err.status() {
                    Some(status) if !Self::RETRYABLE_STATUS_CODES.contains(&status) => {
                        return Err(Error::SourceFatal {
                            connector_id: self.cfg.connector_id.clone(),
                            status,
                            message: err.to_string(),
                        });
                    }
                    Some(status) => {
                        if attempt + 1 < Self::MAX_RETRIES {
                            let delay = Self::RETRY_BASE_DELAY * 2u32.pow(attempt);
                            let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
                            warn!(
                                connector_id = %self.cfg.connector_id,
                                attempt = attempt + 1,
                                max = Self::MAX_RETRIES,
                                status,
                                "Retryable error - sleeping {:?}",
                                delay + jitter
                            );
                            tokio::time::sleep(delay + jitter).await;
                        }
                    }
                    None => {
                        warn!(
                            connector_id = %self.cfg.connector_id,
                            "Fetch failed without an HTTP status: {err}"
                        );
                        break;
                    }
                },
            }
        }
        Err(Error::SourceTimeout {
            connector_id: self.cfg.connector_id.clone(),
            attempts: Self::MAX_RETRIES,
        })
    }
}

/// Build the [`DataSource`] for a connector id. Unknown ids fall back to
/// the manifest-driven generic source.
pub fn source_for(cfg: &ConnectorConfig, client: reqwest::Client) -> Box<dyn DataSource> {
    let transport = transport::HttpTransport::new(cfg.clone(), client);
    match cfg.connector_id.as_str() {
        "github" => Box::new(github::GithubSource::new(transport)),
        "jira" => Box::new(jira::JiraSource::new(transport)),
        "linear" => Box::new(linear::LinearSource::new(transport)),
        _ => Box::new(generic::GenericSource::new(
            cfg.extra_params
                .get("manifest")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            transport,
        )),
    }
}

/// Build the process-wide connector map from a set of connector configs.
pub fn build_connectors(
    configs: &HashMap<String, ConnectorConfig>,
    cache: Arc<RedisCache>,
    limiter: Arc<RateLimiter>,
    client: reqwest::Client,
) -> HashMap<String, Arc<SourceConnector>> {
    configs
        .iter()
        .map(|(id, cfg)| {
            let source = source_for(cfg, client.clone());
            (
                id.clone(),
                Arc::new(SourceConnector::new(
                    cfg.clone(),
                    source,
                    cache.clone(),
                    limiter.clone(),
                )),
            )
        })
        .collect()
}

/// Coerce a JSON value into a row map; non-objects become empty rows.
pub(crate) fn object(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector_for(cfg: ConnectorConfig) -> SourceConnector {
        let cache = Arc::new(RedisCache::new(None));
        let limiter = Arc::new(RateLimiter::new(None));
        let source = source_for(&cfg, reqwest::Client::new());
        SourceConnector::new(cfg, source, cache, limiter)
    }

    fn jira_cfg(base_url: &str) -> ConnectorConfig {
        let mut cfg = ConnectorConfig::mock("jira");
        cfg.base_url = base_url.to_string();
        cfg
    }

    #[tokio::test]
    async fn recovers_after_retryable_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/search"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issues": [{"key": "PRJ-001", "fields": {"summary": "Recovered"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = jira_cfg(&server.uri());
        let connector = connector_for(cfg.clone());
        let start = Instant::now();
        let outcome = connector
            .get_data("t1", &cfg, "all_issues", 0, &Filters::new())
            .await
            .expect("third attempt succeeds");
        // two backoff sleeps: 0.5s and 1.0s, each with at most 10% jitter
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1400), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");
        assert!(!outcome.from_cache);
        assert_eq!(outcome.data.len(), 1);
        assert_eq!(outcome.data[0]["issue_key"], json!("PRJ-001"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/search"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let cfg = jira_cfg(&server.uri());
        let connector = connector_for(cfg.clone());
        let err = connector
            .get_data("t1", &cfg, "all_issues", 0, &Filters::new())
            .await
            .expect_err("all attempts fail");
        assert!(matches!(err, Error::SourceTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn non_retryable_status_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/search"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = jira_cfg(&server.uri());
        let connector = connector_for(cfg.clone());
        let err = connector
            .get_data("t1", &cfg, "all_issues", 0, &Filters::new())
            .await
            .expect_err("404 is fatal");
        assert!(matches!(err, Error::SourceFatal { status: 404, .. }));
    }

    #[tokio::test]
    async fn graphql_body_errors_are_elevated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": [{"message": "rate limited upstream"}]
            })))
            .mount(&server)
            .await;

        let mut cfg = ConnectorConfig::mock("linear");
        cfg.base_url = server.uri();
        let connector = connector_for(cfg.clone());
        let err = connector
            .get_data("t1", &cfg, "all_issues", 0, &Filters::new())
            .await
            .expect_err("body-level errors fail the fetch");
        // No HTTP status to classify, so the attempt loop aborts.
        assert!(matches!(err, Error::SourceTimeout { .. }));
    }

    #[tokio::test]
    async fn follows_rest_link_pagination() {
        let server = MockServer::start().await;
        let next = format!("{}/rest/api/3/search?startAt=2", server.uri());
        Mock::given(method("GET"))
            .and(path("/rest/api/3/search"))
            .and(wiremock::matchers::query_param("startAt", "0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"issues": [{"key": "PRJ-001", "fields": {}}]}))
                    .insert_header("Link", format!("<{next}>; rel=\"next\"").as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/search"))
            .and(wiremock::matchers::query_param("startAt", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issues": [{"key": "PRJ-002", "fields": {}}]
            })))
            .mount(&server)
            .await;

        let cfg = jira_cfg(&server.uri());
        let connector = connector_for(cfg.clone());
        let outcome = connector
            .get_data("t1", &cfg, "all_issues", 0, &Filters::new())
            .await
            .expect("both pages fetched");
        let keys: Vec<_> = outcome
            .data
            .iter()
            .map(|r| r["issue_key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["PRJ-001", "PRJ-002"]);
    }
}
