//! Distributed TTL cache for connector row-sets.
//!
//! Each entry is scoped by tenant so no cross-tenant data leakage is
//! possible at the key level. The store TTL enforces the hard freshness
//! bound (the connector's `freshness_ttl_ms`); the stored `fetched_at`
//! timestamp additionally lets callers demand a stricter soft bound per
//! request (`max_staleness_ms`).
//!
//! Key schema (wire contract shared with other runtimes):
//! `cache:{tenant_id}:{connector_id}:{first 12 hex of md5(sorted filters)}`

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::types::{Filters, Row};

const KEY_PREFIX: &str = "cache";

/// Stored cache value.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Vec<Row>,
    /// Wall-clock seconds since the Unix epoch at fetch time
    pub fetched_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Approximate per-tenant cache statistics, for response metadata.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub tenant_id: String,
    pub cached_entries: u64,
    pub enabled: bool,
}

/// Distributed row-set cache.
///
/// When the store connection is absent the cache is a no-op: every get is a
/// miss and puts are dropped.
pub struct RedisCache {
    conn: Option<ConnectionManager>,
}

impl RedisCache {
    pub fn new(conn: Option<ConnectionManager>) -> Self {
        Self { conn }
    }

    pub fn enabled(&self) -> bool {
        self.conn.is_some()
    }

    /// Canonical fingerprint of a filter set. `Filters` is an ordered map,
    /// so semantically equal filter sets produce identical fingerprints
    /// regardless of insertion order.
    pub fn fingerprint(filters: &Filters) -> String {
        let canonical = serde_json::to_string(filters).unwrap_or_else(|_| "{}".to_string());
        let digest = md5::compute(canonical.as_bytes());
        format!("{digest:x}")[..12].to_string()
    }

    fn build_key(tenant_id: &str, connector_id: &str, filters: &Filters) -> String {
        format!(
            "{KEY_PREFIX}:{tenant_id}:{connector_id}:{}",
            Self::fingerprint(filters)
        )
    }

    fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

    /// Retrieve cached data if within the caller's staleness budget.
    ///
    /// `max_staleness_ms == 0` means live-only: the cache is bypassed
    /// entirely. Undecodable values and store outages count as misses - the
    /// caller falls through to a live fetch, which is the safe direction.
    ///
    /// Returns `(data, age_ms)` on a hit.
    pub async fn get(
        &self,
        tenant_id: &str,
        connector_id: &str,
        max_staleness_ms: u64,
        filters: &Filters,
    ) -> Option<(Vec<Row>, u64)> {
        if max_staleness_ms == 0 {
            return None;
        }
        let conn = self.conn.as_ref()?;
        let mut conn = conn.clone();

        let key = Self::build_key(tenant_id, connector_id, filters);
        let raw: Option<Vec<u8>> = match redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache read failed for {key}: {e}");
                return None;
            }
        };
        let raw = raw?;

        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache deserialization failed for {key}: {e}");
                return None;
            }
        };

        let age_ms = ((Self::now_secs() - entry.fetched_at).max(0.0) * 1000.0) as u64;
        if age_ms > max_staleness_ms {
            return None;
        }

        debug!("Cache HIT {key} (age={age_ms}ms)");
        Some((entry.data, age_ms))
    }

    /// Store data with the connector's configured TTL.
    pub async fn put(
        &self,
        tenant_id: &str,
        connector_id: &str,
        data: &[Row],
        ttl_ms: u64,
        filters: &Filters,
        etag: Option<String>,
    ) -> Result<()> {
        let Some(conn) = &self.conn else {
            return Ok(());
        };
        let mut conn = conn.clone();

        let key = Self::build_key(tenant_id, connector_id, filters);
        let entry = CacheEntry {
            data: data.to_vec(),
            fetched_at: Self::now_secs(),
            etag,
        };
        let packed = serde_json::to_vec(&entry).map_err(|e| Error::Internal {
            operation: format!("serialize cache entry: {e}"),
        })?;
        let ttl_seconds = (ttl_ms / 1000).max(1);

        redis::cmd("SET")
            .arg(&key)
            .arg(packed)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::Internal {
                operation: format!("write cache entry: {e}"),
            })?;

        debug!(
            "Cache PUT {key} (ttl={ttl_seconds}s, rows={})",
            data.len()
        );
        Ok(())
    }

    /// Delete a specific cache entry.
    pub async fn invalidate(
        &self,
        tenant_id: &str,
        connector_id: &str,
        filters: &Filters,
    ) -> Result<()> {
        let Some(conn) = &self.conn else {
            return Ok(());
        };
        let mut conn = conn.clone();
        let key = Self::build_key(tenant_id, connector_id, filters);
        redis::cmd("DEL")
            .arg(&key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::Internal {
                operation: format!("invalidate cache entry: {e}"),
            })?;
        Ok(())
    }

    /// Approximate cache statistics for a tenant. Uses cursor-based SCAN,
    /// never a blocking full-keyspace command, because this runs inside
    /// foreground request handling.
    pub async fn stats(&self, tenant_id: &str) -> CacheStats {
        let Some(conn) = &self.conn else {
            return CacheStats {
                tenant_id: tenant_id.to_string(),
                cached_entries: 0,
                enabled: false,
            };
        };
        let mut conn = conn.clone();

        let pattern = format!("{KEY_PREFIX}:{tenant_id}:*");
        let mut count: u64 = 0;
        let mut cursor: u64 = 0;
        loop {
            let scanned: std::result::Result<(u64, Vec<String>), redis::RedisError> =
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await;
            match scanned {
                Ok((next, keys)) => {
                    count += keys.len() as u64;
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Cache stats scan failed for tenant {tenant_id}: {e}");
                    break;
                }
            }
        }

        CacheStats {
            tenant_id: tenant_id.to_string(),
            cached_entries: count,
            enabled: true,
        }
    }

    /// Health check - true if the store is reachable.
    pub async fn ping(&self) -> bool {
        match &self.conn {
            Some(conn) => {
                let mut conn = conn.clone();
                redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .is_ok()
            }
            None => false,
        }
    }
}
