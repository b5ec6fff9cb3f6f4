//! Rate limiting port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Rate limiter trait - the single gate every inbound request passes.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether the request from `identity` at `now` may proceed.
    ///
    /// Always produces a verdict; store failures are resolved by the
    /// configured failure policy.
    async fn admit(&self, identity: &str, now: DateTime<Utc>) -> Verdict;
}

/// Admission decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// How long to wait before a retry can succeed. Zero when allowed.
    pub retry_after: Duration,
    /// Whole tokens left in the bucket.
    pub remaining: u32,
    /// Configured burst capacity.
    pub limit: u32,
    /// True when the decision came from the failure policy, not the bucket.
    pub degraded: bool,
}

impl Verdict {
    pub fn allow(remaining: u32, limit: u32) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining,
            limit,
            degraded: false,
        }
    }

    pub fn deny(retry_after: Duration, remaining: u32, limit: u32) -> Self {
        Self {
            allowed: false,
            retry_after,
            remaining,
            limit,
            degraded: false,
        }
    }

    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }
}
