//! Token bucket rate limiter over a shared [`BucketStore`].
//!
//! Each decision is load, step, conditional save. Decisions for one
//! identity are serialized inside this process, so the conditional save
//! only loses to writers in other instances. A lost race recomputes the
//! decision from a fresh load until the conflict deadline runs out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::config::{FailurePolicy, RateLimitConfig};
use crate::domain::{BucketAnomaly, BucketRecord, BucketStep, TokenBucket};
use crate::error::{ConfigError, LimiterError};
use crate::ports::{BucketStore, RateLimiter, SaveOutcome, StoreError, Verdict};

/// Distributed token bucket limiter.
pub struct TokenBucketLimiter {
    store: Arc<dyn BucketStore>,
    bucket: TokenBucket,
    config: RateLimitConfig,
    in_flight: IdentityLocks,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            bucket: config.bucket(),
            config,
            in_flight: IdentityLocks::default(),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check the store behind this limiter.
    pub async fn ping(&self) -> Result<(), LimiterError> {
        self.bounded(self.store.ping()).await?;
        Ok(())
    }

    /// Take a decision from the bucket, surfacing store failures as errors.
    pub async fn try_admit(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Verdict, LimiterError> {
        let now_ms = now.timestamp_millis();
        let _turn = self.in_flight.acquire(identity).await;
        let deadline = Instant::now() + self.config.conflict_deadline();

        loop {
            let record = self.load(identity, now_ms).await?;
            let step = self.bucket.step(record, now_ms);
            if let Some(anomaly) = step.anomaly {
                report_anomaly(identity, anomaly);
            }

            match self.bounded(self.store.save(identity, &step.record)).await? {
                SaveOutcome::Saved => return Ok(self.verdict(&step)),
                SaveOutcome::Conflict if Instant::now() >= deadline => {
                    return Err(LimiterError::StoreUnavailable(format!(
                        "bucket still changing after {}ms of conflicting writes",
                        self.config.conflict_deadline().as_millis()
                    )));
                }
                SaveOutcome::Conflict => {
                    tracing::trace!(identity = %identity, "Bucket changed concurrently, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn load(&self, identity: &str, now_ms: i64) -> Result<BucketRecord, LimiterError> {
        match self.bounded(self.store.load(identity)).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Ok(BucketRecord::full(self.bucket.capacity(), now_ms)),
            Err(StoreError::Corrupt { revision, reason }) => {
                tracing::warn!(
                    identity = %identity,
                    revision,
                    reason = %reason,
                    "Corrupt bucket record, resetting with no credit"
                );
                Ok(BucketRecord {
                    tokens: 0.0,
                    last_refill_ms: now_ms,
                    revision,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the store timeout to one store call.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .map_err(|_| {
                StoreError::Unavailable(format!(
                    "timed out after {}ms",
                    self.config.store_timeout.as_millis()
                ))
            })?
    }

    fn verdict(&self, step: &BucketStep) -> Verdict {
        if step.allowed {
            Verdict::allow(step.remaining(), self.config.capacity)
        } else {
            Verdict::deny(step.retry_after, step.remaining(), self.config.capacity)
        }
    }

    fn fallback(&self, identity: &str, err: &LimiterError) -> Verdict {
        let LimiterError::StoreUnavailable(reason) = err;
        tracing::error!(
            identity = %identity,
            error = %reason,
            policy = %self.config.failure_policy,
            "Rate limit store unavailable, applying failure policy"
        );
        match self.config.failure_policy {
            FailurePolicy::Open => Verdict::allow(0, self.config.capacity).degraded(),
            FailurePolicy::Closed => {
                Verdict::deny(self.config.outage_retry_after, 0, self.config.capacity).degraded()
            }
        }
    }
}

/// One async mutex per identity with a decision in flight.
#[derive(Default)]
struct IdentityLocks {
    held: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    async fn acquire(&self, identity: &str) -> IdentityTurn<'_> {
        let lock = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;

        IdentityTurn {
            locks: self,
            identity: identity.to_string(),
            lock,
            guard: Some(guard),
        }
    }
}

/// Exclusive turn at one identity's bucket; released on drop.
struct IdentityTurn<'a> {
    locks: &'a IdentityLocks,
    identity: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentityTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this turn still refer to the lock: nobody is queued.
        if Arc::strong_count(&self.lock) == 2 {
            held.remove(&self.identity);
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn admit(&self, identity: &str, now: DateTime<Utc>) -> Verdict {
        match self.try_admit(identity, now).await {
            Ok(verdict) => {
                if !verdict.allowed {
                    tracing::debug!(
                        identity = %identity,
                        retry_after_ms = verdict.retry_after.as_millis() as u64,
                        "Request denied by rate limit"
                    );
                }
                verdict
            }
            Err(err) => self.fallback(identity, &err),
        }
    }
}

fn report_anomaly(identity: &str, anomaly: BucketAnomaly) {
    match anomaly {
        BucketAnomaly::ClockRegression { behind_ms } => {
            tracing::warn!(
                identity = %identity,
                behind_ms,
                "Clock went backwards for bucket, treating elapsed time as zero"
            );
        }
        BucketAnomaly::TokensOutOfRange { tokens } => {
            tracing::warn!(identity = %identity, tokens, "Stored token count out of range, clamped");
        }
    }
}
