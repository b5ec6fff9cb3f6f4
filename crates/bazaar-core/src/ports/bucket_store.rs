//! Bucket store port - shared durable storage for bucket records.

use async_trait::async_trait;

use crate::domain::BucketRecord;

/// Result of a conditional save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The record was written and its revision bumped.
    Saved,
    /// Another writer committed since the record was loaded.
    Conflict,
}

/// Bucket store trait - abstraction over the shared store (Redis, in-memory).
///
/// Implementations must make `save` a single atomic compare-and-set on
/// `record.revision`; that is what keeps concurrent admissions for one
/// identity serializable across processes.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Load the bucket for an identity, `None` if it was never stored or expired.
    async fn load(&self, identity: &str) -> Result<Option<BucketRecord>, StoreError>;

    /// Write `record` if the stored revision still equals `record.revision`.
    ///
    /// A record with revision `0` is only written if no bucket exists.
    async fn save(&self, identity: &str, record: &BucketRecord) -> Result<SaveOutcome, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Bucket store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt bucket record at revision {revision}: {reason}")]
    Corrupt { revision: u64, reason: String },
}
