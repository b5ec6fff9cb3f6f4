//! Application configuration loaded from environment variables.

use std::env;

use bazaar_core::{ConfigError, RateLimitConfig};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Key rate limits on proxy-supplied client addresses.
    pub trust_proxy_headers: bool,
    /// Use the shared Redis store (`REDIS_URL` is set).
    pub redis_enabled: bool,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            trust_proxy_headers: env::var("TRUST_PROXY_HEADERS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            redis_enabled: env::var("REDIS_URL").is_ok(),
            rate_limit: RateLimitConfig::from_env()?,
        })
    }
}
