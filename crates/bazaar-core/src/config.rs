//! Rate limit policy configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::TokenBucket;
use crate::error::ConfigError;

const CONFLICT_DEADLINE_FACTOR: u32 = 4;

/// What to decide when the bucket store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Admit every request during an outage.
    Open,
    /// Deny every request during an outage.
    #[default]
    Closed,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => Err(ConfigError::invalid(
                "RATE_LIMIT_FAILURE_POLICY",
                format!("expected `open` or `closed`, got `{}`", other),
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Open => write!(f, "open"),
            FailurePolicy::Closed => write!(f, "closed"),
        }
    }
}

/// Process-wide rate limit configuration, fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum burst size in tokens.
    pub capacity: u32,
    /// Steady-state refill rate.
    pub refill_per_ms: f64,
    /// Decision to take when the store is unavailable.
    pub failure_policy: FailurePolicy,
    /// Upper bound for each store call.
    pub store_timeout: Duration,
    /// Retry hint sent while failing closed.
    pub outage_retry_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_window(30, Duration::from_secs(60))
    }
}

impl RateLimitConfig {
    /// `capacity` tokens that refill completely over `window`.
    pub fn per_window(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            refill_per_ms: f64::from(capacity) / window.as_millis() as f64,
            failure_policy: FailurePolicy::default(),
            store_timeout: Duration::from_millis(250),
            outage_retry_after: Duration::from_secs(1),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let capacity = parse_or(&lookup, "RATE_LIMIT_CAPACITY", 30u32)?;
        let window_ms = parse_or(&lookup, "RATE_LIMIT_WINDOW_MS", 60_000u64)?;
        if window_ms == 0 {
            return Err(ConfigError::invalid("RATE_LIMIT_WINDOW_MS", "must be positive"));
        }

        let mut config = Self::per_window(capacity, Duration::from_millis(window_ms));

        if let Some(policy) = lookup("RATE_LIMIT_FAILURE_POLICY") {
            config.failure_policy = policy.parse()?;
        }
        config.store_timeout = Duration::from_millis(parse_or(
            &lookup,
            "RATE_LIMIT_STORE_TIMEOUT_MS",
            250u64,
        )?);
        config.outage_retry_after = Duration::from_millis(parse_or(
            &lookup,
            "RATE_LIMIT_OUTAGE_RETRY_AFTER_MS",
            1_000u64,
        )?);

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the token bucket cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("RATE_LIMIT_CAPACITY", "must be at least 1"));
        }
        if !self.refill_per_ms.is_finite() || self.refill_per_ms <= 0.0 {
            return Err(ConfigError::invalid(
                "RATE_LIMIT_WINDOW_MS",
                format!("refill rate {} is not a positive number", self.refill_per_ms),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::invalid("RATE_LIMIT_STORE_TIMEOUT_MS", "must be positive"));
        }
        Ok(())
    }

    pub fn bucket(&self) -> TokenBucket {
        TokenBucket::new(self.capacity, self.refill_per_ms)
    }

    /// How long a decision may keep losing write races to other instances
    /// before the store is treated as unavailable.
    pub fn conflict_deadline(&self) -> Duration {
        self.store_timeout * CONFLICT_DEADLINE_FACTOR
    }

    /// Idle time after which a stored bucket is indistinguishable from a new one.
    pub fn idle_ttl(&self) -> Duration {
        self.bucket().full_refill_time()
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("`{}`: {}", raw, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_thirty_per_minute() {
        let config = RateLimitConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.capacity, 30);
        assert_eq!(config.refill_per_ms, 30.0 / 60_000.0);
        assert_eq!(config.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.idle_ttl(), Duration::from_secs(60));
        assert_eq!(config.conflict_deadline(), Duration::from_secs(1));
    }

    #[test]
    fn test_overrides() {
        let config = RateLimitConfig::from_lookup(lookup(&[
            ("RATE_LIMIT_CAPACITY", "10"),
            ("RATE_LIMIT_WINDOW_MS", "1000"),
            ("RATE_LIMIT_FAILURE_POLICY", "Open"),
            ("RATE_LIMIT_STORE_TIMEOUT_MS", "50"),
        ]))
        .unwrap();

        assert_eq!(config.capacity, 10);
        assert_eq!(config.refill_per_ms, 0.01);
        assert_eq!(config.failure_policy, FailurePolicy::Open);
        assert_eq!(config.store_timeout, Duration::from_millis(50));
        assert_eq!(config.conflict_deadline(), Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero = RateLimitConfig::from_lookup(lookup(&[("RATE_LIMIT_CAPACITY", "0")]));
        assert!(matches!(
            zero,
            Err(ConfigError::Invalid { key: "RATE_LIMIT_CAPACITY", .. })
        ));

        let window = RateLimitConfig::from_lookup(lookup(&[("RATE_LIMIT_WINDOW_MS", "0")]));
        assert!(window.is_err());

        let policy = RateLimitConfig::from_lookup(lookup(&[("RATE_LIMIT_FAILURE_POLICY", "maybe")]));
        assert!(policy.is_err());

        let garbage = RateLimitConfig::from_lookup(lookup(&[("RATE_LIMIT_CAPACITY", "lots")]));
        assert!(garbage.is_err());
    }
}
