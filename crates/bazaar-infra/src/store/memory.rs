//! In-memory bucket store - used when Redis is not configured, and in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use bazaar_core::domain::BucketRecord;
use bazaar_core::ports::{BucketStore, SaveOutcome, StoreError};

struct BucketEntry {
    record: BucketRecord,
    expires_at: Option<Instant>,
}

impl BucketEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now < exp).unwrap_or(true)
    }
}

/// In-memory bucket store using a HashMap behind an async RwLock.
///
/// Compare-and-set happens under the write lock, so it is atomic within
/// this process. Limits are per-process, not shared across instances, and
/// buckets are lost on restart.
pub struct InMemoryBucketStore {
    buckets: RwLock<HashMap<String, BucketEntry>>,
    idle_ttl: Option<Duration>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            idle_ttl: None,
        }
    }

    /// Drop buckets that have not been written for `ttl`.
    pub fn with_idle_ttl(ttl: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            idle_ttl: Some(ttl),
        }
    }

    /// Number of buckets held, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove expired buckets. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, entry| entry.is_live(now));
        before - buckets.len()
    }

    /// Periodically purge expired buckets for as long as the store is alive.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired().await;
                if purged > 0 {
                    tracing::debug!(purged, "Purged idle rate limit buckets");
                }
            }
        })
    }
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn load(&self, identity: &str) -> Result<Option<BucketRecord>, StoreError> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .get(identity)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.record))
    }

    async fn save(&self, identity: &str, record: &BucketRecord) -> Result<SaveOutcome, StoreError> {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;

        let existing = buckets.get(identity);
        let current = existing
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.record.revision)
            .unwrap_or(0);
        if current != record.revision {
            return Ok(SaveOutcome::Conflict);
        }

        // Revisions keep counting across expiry so a stale writer can never match.
        let next = existing.map(|entry| entry.record.revision).unwrap_or(0) + 1;
        buckets.insert(
            identity.to_string(),
            BucketEntry {
                record: BucketRecord {
                    revision: next,
                    ..*record
                },
                expires_at: self.idle_ttl.map(|ttl| now + ttl),
            },
        );

        Ok(SaveOutcome::Saved)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
