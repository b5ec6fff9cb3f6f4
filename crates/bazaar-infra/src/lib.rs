//! # Bazaar Infrastructure
//!
//! Concrete implementations of the ports defined in `bazaar-core`.
//!
//! ## Feature Flags
//!
//! - `redis` (default) - Redis-backed bucket store shared across instances
//! - Without `redis`, only the in-memory store is built

pub mod store;

// Re-exports - In-Memory
pub use store::InMemoryBucketStore;

// Re-exports - Redis
#[cfg(feature = "redis")]
pub use store::{RedisBucketStore, RedisBucketStoreConfig, RedisConfig};
