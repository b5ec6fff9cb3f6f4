//! Application state - shared across all handlers.

use std::fmt;
use std::sync::Arc;

use bazaar_core::TokenBucketLimiter;
use bazaar_core::ports::{BucketStore, StoreError};
use bazaar_infra::InMemoryBucketStore;

#[cfg(feature = "redis")]
use bazaar_infra::{RedisBucketStore, RedisBucketStoreConfig};

use crate::config::AppConfig;

/// Which store holds the rate limit buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => write!(f, "redis"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<TokenBucketLimiter>,
    pub backend: StoreBackend,
}

impl AppState {
    /// Build the application state, connecting the bucket store once for the process.
    pub async fn new(config: &AppConfig) -> Result<Self, StartupError> {
        let (store, backend) = Self::bucket_store(config).await?;
        let limiter = TokenBucketLimiter::new(store, config.rate_limit.clone())?;

        tracing::info!(
            backend = %backend,
            capacity = config.rate_limit.capacity,
            refill_per_ms = config.rate_limit.refill_per_ms,
            failure_policy = %config.rate_limit.failure_policy,
            "Application state initialized"
        );

        Ok(Self {
            limiter: Arc::new(limiter),
            backend,
        })
    }

    #[cfg(feature = "redis")]
    async fn bucket_store(
        config: &AppConfig,
    ) -> Result<(Arc<dyn BucketStore>, StoreBackend), StartupError> {
        if !config.redis_enabled {
            tracing::warn!("REDIS_URL not set. Rate limits are per-process (in-memory store).");
            return Ok(Self::memory_store(config));
        }

        let store_config =
            RedisBucketStoreConfig::from_env().with_idle_ttl(config.rate_limit.idle_ttl());
        let fallback = store_config.redis.fallback_to_memory;

        match RedisBucketStore::new(store_config).await {
            Ok(store) => Ok((Arc::new(store), StoreBackend::Redis)),
            Err(e) if fallback => {
                tracing::error!(
                    "Failed to connect to Redis: {}. Using in-memory fallback.",
                    e
                );
                Ok(Self::memory_store(config))
            }
            Err(e) => Err(StartupError::Store(e)),
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn bucket_store(
        config: &AppConfig,
    ) -> Result<(Arc<dyn BucketStore>, StoreBackend), StartupError> {
        tracing::info!("Running without redis feature - using in-memory bucket store");
        Ok(Self::memory_store(config))
    }

    fn memory_store(config: &AppConfig) -> (Arc<dyn BucketStore>, StoreBackend) {
        let ttl = config.rate_limit.idle_ttl();
        let store = Arc::new(InMemoryBucketStore::with_idle_ttl(ttl));
        store.spawn_sweeper(ttl);
        (store, StoreBackend::Memory)
    }
}

/// Errors that stop the server from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] bazaar_core::ConfigError),

    #[error("Bucket store unavailable: {0}")]
    Store(#[from] StoreError),
}
