//! Distributed token-bucket rate limiter backed by the shared store.
//!
//! All gateway instances share the same key per `(tenant, connector)`, so
//! the budget is enforced globally across the fleet. Refill and consume run
//! as a single server-side script - no check-then-write race between
//! contending instances.
//!
//! Key schema: `ratelimit:{tenant_id}:{connector_id}`, a hash with fields
//! `tokens` (float) and `last_refill` (Unix timestamp). The key TTL is
//! `ceil(2 * capacity / refill_rate)` seconds so idle buckets evict but
//! active ones never expire mid-flight.

use redis::Script;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::errors::{Error, Result};

// Atomic token-bucket refill + consume.
//
// KEYS[1] = ratelimit:{tenant_id}:{connector_id}
// ARGV[1] = capacity     (int)
// ARGV[2] = refill_rate  (float, tokens/second)
// ARGV[3] = requested    (int, tokens to consume)
// ARGV[4] = now          (float, Unix timestamp)
//
// Returns: {allowed (0|1), remaining_tokens (int)}
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key          = KEYS[1]
local capacity     = tonumber(ARGV[1])
local refill_rate  = tonumber(ARGV[2])
local requested    = tonumber(ARGV[3])
local now          = tonumber(ARGV[4])

local data        = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens      = tonumber(data[1]) or capacity
local last_refill = tonumber(data[2]) or now

local delta   = math.max(0, now - last_refill)
local new_tok = math.min(capacity, tokens + delta * refill_rate)

local allowed = 0
if new_tok >= requested then
    new_tok = new_tok - requested
    allowed = 1
end

local ttl = math.ceil((capacity / refill_rate) * 2)
redis.call('HSET', key, 'tokens', tostring(new_tok), 'last_refill', tostring(now))
redis.call('EXPIRE', key, ttl)

return {allowed, math.floor(new_tok)}
"#;

/// Current bucket state, returned as response metadata.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RateLimitStatus {
    pub connector_id: String,
    pub remaining: i64,
    pub capacity: u32,
}

/// Fleet-wide token bucket per `(tenant, connector)`.
///
/// When the store connection is absent (local dev without Redis) every
/// consume is allowed and status reports a full bucket.
pub struct RateLimiter {
    conn: Option<ConnectionManager>,
    script: Script,
}

impl RateLimiter {
    pub fn new(conn: Option<ConnectionManager>) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }

    fn build_key(tenant_id: &str, connector_id: &str) -> String {
        format!("ratelimit:{tenant_id}:{connector_id}")
    }

    fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

    /// Attempt to consume `amount` tokens. Executes atomically at the store.
    ///
    /// Returns `(allowed, remaining)` where `remaining` is the bucket level
    /// after this call, rounded down.
    pub async fn consume(
        &self,
        tenant_id: &str,
        connector_id: &str,
        capacity: u32,
        refill_rate: f64,
        amount: u32,
    ) -> Result<(bool, i64)> {
        let Some(conn) = &self.conn else {
            return Ok((true, i64::from(capacity)));
        };
        let mut conn = conn.clone();

        let key = Self::build_key(tenant_id, connector_id);
        let mut invocation = self.script.key(&key);
        invocation
            .arg(capacity)
            .arg(refill_rate)
            .arg(amount)
            .arg(Self::now_secs());

        let (allowed, remaining): (i64, i64) =
            invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| Error::Internal {
                    operation: format!("consume rate-limit tokens: {e}"),
                })?;

        let allowed = allowed == 1;
        if !allowed {
            warn!(
                tenant_id,
                connector_id, remaining, "Rate limit hit"
            );
        }
        Ok((allowed, remaining))
    }

    /// Return the bucket state without consuming tokens. Non-atomic and
    /// possibly slightly stale; used only for response metadata.
    pub async fn status(
        &self,
        tenant_id: &str,
        connector_id: &str,
        capacity: u32,
    ) -> RateLimitStatus {
        let remaining = match &self.conn {
            Some(conn) => {
                let mut conn = conn.clone();
                let key = Self::build_key(tenant_id, connector_id);
                let tokens: Option<String> = redis::cmd("HGET")
                    .arg(&key)
                    .arg("tokens")
                    .query_async(&mut conn)
                    .await
                    .unwrap_or(None);
                tokens
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .map(|t| t.floor() as i64)
                    .unwrap_or(i64::from(capacity))
            }
            None => i64::from(capacity),
        };

        RateLimitStatus {
            connector_id: connector_id.to_string(),
            remaining,
            capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(None);
        let (allowed, remaining) = limiter
            .consume("t1", "github", 5, 1.0, 1)
            .await
            .expect("consume");
        assert!(allowed);
        assert_eq!(remaining, 5);

        let status = limiter.status("t1", "github", 5).await;
        assert_eq!(status.remaining, 5);
        assert_eq!(status.capacity, 5);
    }

    #[test]
    fn keys_are_tenant_scoped() {
        assert_eq!(
            RateLimiter::build_key("acme", "github"),
            "ratelimit:acme:github"
        );
        assert_ne!(
            RateLimiter::build_key("acme", "github"),
            RateLimiter::build_key("globex", "github")
        );
    }
}
