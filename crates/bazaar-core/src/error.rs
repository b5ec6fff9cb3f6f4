//! Domain-level error types.

use thiserror::Error;

use crate::ports::StoreError;

/// Why an admission decision could not be taken from the bucket itself.
#[derive(Debug, Clone, Error)]
pub enum LimiterError {
    #[error("Bucket store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for LimiterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => LimiterError::StoreUnavailable(msg),
            // Corrupt records are recovered inside the limiter and never reach here.
            StoreError::Corrupt { revision, reason } => LimiterError::StoreUnavailable(format!(
                "unrecovered corrupt record at revision {}: {}",
                revision, reason
            )),
        }
    }
}

/// Startup configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
