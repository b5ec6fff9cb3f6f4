//! Token bucket state and the pure refill/consume step.

use std::time::Duration;

/// Persisted state of one client's bucket.
///
/// The identity is the store key and is not part of the record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRecord {
    /// Admission tokens currently available (fractional).
    pub tokens: f64,
    /// Unix epoch milliseconds of the last check against this bucket.
    pub last_refill_ms: i64,
    /// Write counter used for compare-and-set. `0` means never stored.
    pub revision: u64,
}

impl BucketRecord {
    /// A full bucket that has never been written to the store.
    pub fn full(capacity: f64, now_ms: i64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
            revision: 0,
        }
    }
}

/// A recoverable inconsistency noticed while stepping a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketAnomaly {
    /// `now` is earlier than the stored refill time.
    ClockRegression { behind_ms: i64 },
    /// Stored token count was outside `[0, capacity]`.
    TokensOutOfRange { tokens: f64 },
}

/// Outcome of applying one admission check to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStep {
    /// Record to persist; carries the revision it was loaded with.
    pub record: BucketRecord,
    pub allowed: bool,
    /// Tokens after refill, before consumption.
    pub refilled: f64,
    /// Wait until one token is available. Zero when admitted.
    pub retry_after: Duration,
    pub anomaly: Option<BucketAnomaly>,
}

impl BucketStep {
    /// Whole tokens left after this step.
    pub fn remaining(&self) -> u32 {
        self.record.tokens.floor() as u32
    }
}

/// Token bucket parameters. Pure math, no I/O and no clock access.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_ms: f64,
}

impl TokenBucket {
    /// `capacity` must be at least 1 and `refill_per_ms` positive and finite;
    /// `RateLimitConfig::validate` enforces both.
    pub fn new(capacity: u32, refill_per_ms: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_ms,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_ms(&self) -> f64 {
        self.refill_per_ms
    }

    /// Time for an empty bucket to refill completely.
    pub fn full_refill_time(&self) -> Duration {
        millis_ceil(self.capacity / self.refill_per_ms)
    }

    /// Refill `record` up to `now_ms` and try to take one token.
    ///
    /// Denials still advance the refill time and keep the fractional credit,
    /// so the next check only accrues from `now_ms` on.
    pub fn step(&self, record: BucketRecord, now_ms: i64) -> BucketStep {
        let mut anomaly = None;

        let mut tokens = record.tokens;
        if !(0.0..=self.capacity).contains(&tokens) {
            anomaly = Some(BucketAnomaly::TokensOutOfRange { tokens });
            // NaN never satisfies the range check; treat it as empty.
            tokens = if tokens.is_nan() {
                0.0
            } else {
                tokens.clamp(0.0, self.capacity)
            };
        }

        let elapsed_ms = now_ms.saturating_sub(record.last_refill_ms);
        let elapsed_ms = if elapsed_ms < 0 {
            anomaly = Some(BucketAnomaly::ClockRegression {
                behind_ms: elapsed_ms.saturating_neg(),
            });
            0
        } else {
            elapsed_ms
        };

        let refilled =
            (tokens + self.refill_per_ms * elapsed_ms as f64).clamp(0.0, self.capacity);

        let (allowed, tokens, retry_after) = if refilled >= 1.0 {
            (true, refilled - 1.0, Duration::ZERO)
        } else {
            let wait_ms = (1.0 - refilled) / self.refill_per_ms;
            (false, refilled, millis_ceil(wait_ms))
        };

        BucketStep {
            record: BucketRecord {
                tokens,
                last_refill_ms: now_ms,
                revision: record.revision,
            },
            allowed,
            refilled,
            retry_after,
            anomaly,
        }
    }
}

/// Rounds up so a retry hint never points before the token exists.
fn millis_ceil(ms: f64) -> Duration {
    Duration::from_millis(ms.ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_minute(capacity: u32) -> TokenBucket {
        TokenBucket::new(capacity, f64::from(capacity) / 60_000.0)
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let bucket = TokenBucket::new(10, 0.001);
        let mut record = BucketRecord::full(bucket.capacity(), 0);

        for i in 0..10 {
            let step = bucket.step(record, 0);
            assert!(step.allowed, "request {} should be admitted", i + 1);
            record = step.record;
        }

        let step = bucket.step(record, 0);
        assert!(!step.allowed);
        assert_eq!(step.remaining(), 0);
    }

    #[test]
    fn test_tokens_stay_within_capacity() {
        let bucket = TokenBucket::new(5, 0.01);
        let mut record = BucketRecord::full(bucket.capacity(), 0);
        let mut now = 0;

        for gap in [0, 0, 50, 1_000_000, 0, 0, 0, 0, 0, 0, 3, 250, 0] {
            now += gap;
            let step = bucket.step(record, now);
            assert!(step.record.tokens >= 0.0);
            assert!(step.record.tokens <= bucket.capacity());
            record = step.record;
        }
    }

    #[test]
    fn test_refill_after_idle_period() {
        let bucket = TokenBucket::new(10, 0.002);
        let record = BucketRecord {
            tokens: 2.0,
            last_refill_ms: 1_000,
            revision: 4,
        };

        let step = bucket.step(record, 2_000);

        assert!(step.allowed);
        assert_eq!(step.refilled, 4.0);
        assert_eq!(step.record.tokens, 3.0);
        assert_eq!(step.record.last_refill_ms, 2_000);
        assert_eq!(step.record.revision, 4);
    }

    #[test]
    fn test_refill_clamped_at_capacity() {
        let bucket = TokenBucket::new(10, 0.002);
        let record = BucketRecord {
            tokens: 9.0,
            last_refill_ms: 0,
            revision: 1,
        };

        let step = bucket.step(record, 60_000);
        assert_eq!(step.refilled, 10.0);
        assert_eq!(step.record.tokens, 9.0);
    }

    #[test]
    fn test_denial_keeps_partial_credit() {
        // 1 token per 1000 ms
        let bucket = TokenBucket::new(1, 0.001);
        let empty = BucketRecord {
            tokens: 0.0,
            last_refill_ms: 0,
            revision: 1,
        };

        let denied = bucket.step(empty, 400);
        assert!(!denied.allowed);
        assert!((denied.record.tokens - 0.4).abs() < 1e-9);
        assert_eq!(denied.record.last_refill_ms, 400);
        assert_eq!(denied.retry_after, Duration::from_millis(600));

        // Another 600 ms completes the token only if the 0.4 was kept.
        let admitted = bucket.step(denied.record, 1_000);
        assert!(admitted.allowed);

        let early = bucket.step(denied.record, 999);
        assert!(!early.allowed);
    }

    #[test]
    fn test_retry_after_for_thirty_per_minute() {
        let bucket = per_minute(30);
        let empty = BucketRecord {
            tokens: 0.0,
            last_refill_ms: 0,
            revision: 30,
        };

        let step = bucket.step(empty, 0);
        assert!(!step.allowed);
        assert_eq!(step.retry_after, Duration::from_millis(2_000));
        assert!(bucket.step(step.record, 2_000).allowed);
    }

    #[test]
    fn test_clock_regression_counts_as_zero_elapsed() {
        let bucket = TokenBucket::new(10, 0.001);
        let record = BucketRecord {
            tokens: 3.0,
            last_refill_ms: 5_000,
            revision: 2,
        };

        let step = bucket.step(record, 4_000);

        assert!(step.allowed);
        assert_eq!(step.refilled, 3.0);
        assert_eq!(step.record.last_refill_ms, 4_000);
        assert_eq!(
            step.anomaly,
            Some(BucketAnomaly::ClockRegression { behind_ms: 1_000 })
        );
    }

    #[test]
    fn test_out_of_range_tokens_are_clamped() {
        let bucket = TokenBucket::new(5, 0.001);

        let shrunk = BucketRecord {
            tokens: 50.0,
            last_refill_ms: 0,
            revision: 1,
        };
        let step = bucket.step(shrunk, 0);
        assert_eq!(step.refilled, 5.0);
        assert!(matches!(
            step.anomaly,
            Some(BucketAnomaly::TokensOutOfRange { .. })
        ));

        let garbage = BucketRecord {
            tokens: f64::NAN,
            last_refill_ms: 0,
            revision: 1,
        };
        let step = bucket.step(garbage, 0);
        assert!(!step.allowed);
        assert_eq!(step.record.tokens, 0.0);
    }

    #[test]
    fn test_full_refill_time() {
        assert_eq!(per_minute(30).full_refill_time(), Duration::from_secs(60));
    }
}
