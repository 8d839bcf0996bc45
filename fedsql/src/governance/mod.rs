//! Governance primitives: the fleet-wide rate limiter.

pub mod rate_limiter;

pub use rate_limiter::{RateLimitStatus, RateLimiter};
