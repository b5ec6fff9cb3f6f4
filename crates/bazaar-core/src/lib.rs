//! # Bazaar Core
//!
//! The admission-control layer of the Bazaar backend.
//! Token bucket math, the ports the limiter depends on, and the limiter
//! itself. No network code lives here; stores are injected.

pub mod config;
pub mod domain;
pub mod error;
pub mod limiter;
pub mod ports;

pub use config::{FailurePolicy, RateLimitConfig};
pub use error::{ConfigError, LimiterError};
pub use limiter::TokenBucketLimiter;
