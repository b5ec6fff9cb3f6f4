//! Redis bucket store - one hash per identity, compare-and-set via Lua.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use bazaar_core::domain::BucketRecord;
use bazaar_core::ports::{BucketStore, SaveOutcome, StoreError};

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Whether to fall back to the in-memory store if Redis is unreachable at startup
    pub fallback_to_memory: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            fallback_to_memory: true,
        }
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            connect_timeout: Duration::from_secs(
                std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            fallback_to_memory: std::env::var("REDIS_FALLBACK_TO_MEMORY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        }
    }
}

/// Redis bucket store configuration.
#[derive(Debug, Clone)]
pub struct RedisBucketStoreConfig {
    /// Redis connection config
    pub redis: RedisConfig,
    /// Key prefix for bucket hashes
    pub key_prefix: String,
    /// Expire buckets that have not been written for this long
    pub idle_ttl: Option<Duration>,
}

impl Default for RedisBucketStoreConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            key_prefix: "ratelimit".to_string(),
            idle_ttl: None,
        }
    }
}

impl RedisBucketStoreConfig {
    pub fn from_env() -> Self {
        Self {
            redis: RedisConfig::from_env(),
            key_prefix: std::env::var("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|_| "ratelimit".to_string()),
            idle_ttl: None,
        }
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }
}

/// Longest revision accepted back from Redis, in decimal digits.
const MAX_REVISION_DIGITS: usize = 18;

// KEYS[1] bucket hash
// ARGV: expected revision, next revision, tokens, last_refill_ms, idle ttl in ms (0 = none)
// Returns 1 when written, 0 when the revision moved on.
//
// Revisions are compared as strings. Anything but a canonical decimal of at
// most 18 digits reads as "0", the same as `parse_revision`.
const SAVE_SCRIPT: &str = r#"
local key = KEYS[1]
local current = redis.call('HGET', key, 'revision')
if not current or #current > 18
    or not (current == '0' or string.match(current, '^[1-9]%d*$')) then
    current = '0'
end
if current ~= ARGV[1] then
    return 0
end

redis.call('HSET', key,
    'tokens', ARGV[3],
    'last_refill_ms', ARGV[4],
    'revision', ARGV[2])

local ttl_ms = tonumber(ARGV[5])
if ttl_ms > 0 then
    redis.call('PEXPIRE', key, ttl_ms)
end
return 1
"#;

/// Redis-backed bucket store shared by every server instance.
///
/// Each bucket is a flat hash `{tokens, last_refill_ms, revision}` loaded
/// with a single `HMGET` and written with a single script call.
pub struct RedisBucketStore {
    conn: ConnectionManager,
    config: RedisBucketStoreConfig,
    save_script: Script,
}

impl RedisBucketStore {
    pub async fn new(config: RedisBucketStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.redis.url.as_str())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        // Use timeout to prevent hanging if Redis is unreachable
        let conn_manager_fut = ConnectionManager::new(client);
        let conn = tokio::time::timeout(config.redis.connect_timeout, conn_manager_fut)
            .await
            .map_err(|_| StoreError::Unavailable("Connection timed out".to_string()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::info!(
            url = %config.redis.url,
            prefix = %config.key_prefix,
            "Connected to Redis bucket store"
        );

        Ok(Self {
            conn,
            config,
            save_script: Script::new(SAVE_SCRIPT),
        })
    }

    /// Create from environment configuration.
    pub async fn from_env() -> Result<Self, StoreError> {
        Self::new(RedisBucketStoreConfig::from_env()).await
    }

    fn make_key(&self, identity: &str) -> String {
        format!("{}:{}", self.config.key_prefix, identity)
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn load(&self, identity: &str) -> Result<Option<BucketRecord>, StoreError> {
        let mut conn = self.conn.clone();

        let fields: (Option<String>, Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.make_key(identity))
            .arg("tokens")
            .arg("last_refill_ms")
            .arg("revision")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        parse_record(fields)
    }

    async fn save(&self, identity: &str, record: &BucketRecord) -> Result<SaveOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = self
            .config
            .idle_ttl
            .map(|ttl| ttl.as_millis() as u64)
            .unwrap_or(0);

        let written: i64 = self
            .save_script
            .key(self.make_key(identity))
            .arg(record.revision.to_string())
            .arg(next_revision(record.revision, revision_seed()).to_string())
            .arg(record.tokens.to_string())
            .arg(record.last_refill_ms)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(if written == 1 {
            SaveOutcome::Saved
        } else {
            SaveOutcome::Conflict
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Revision written by a save expecting `expected`.
///
/// A bucket created from nothing starts at `seed` rather than 1, so a writer
/// still holding a revision from before the key expired cannot match it.
fn next_revision(expected: u64, seed: u64) -> u64 {
    if expected == 0 {
        seed.max(1)
    } else {
        expected + 1
    }
}

/// Wall clock in microseconds.
fn revision_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
}

/// Strict decimal revision, rejecting what the save script would not match.
fn parse_revision(raw: &str) -> Option<u64> {
    let canonical = raw == "0"
        || (raw.len() <= MAX_REVISION_DIGITS
            && !raw.starts_with('0')
            && raw.bytes().all(|b| b.is_ascii_digit()));
    if canonical { raw.parse().ok() } else { None }
}

/// Turn an `HMGET` reply into a record. All fields absent means no bucket.
fn parse_record(
    (tokens, last_refill_ms, revision): (Option<String>, Option<String>, Option<String>),
) -> Result<Option<BucketRecord>, StoreError> {
    if tokens.is_none() && last_refill_ms.is_none() && revision.is_none() {
        return Ok(None);
    }

    // The script reads a missing or malformed revision as 0.
    let parsed = revision.as_deref().map(parse_revision);
    let corrupt = |revision: u64, reason: String| StoreError::Corrupt { revision, reason };
    let revision = match parsed {
        Some(Some(revision)) => revision,
        Some(None) => {
            return Err(corrupt(
                0,
                format!("revision: `{}`", revision.unwrap_or_default()),
            ));
        }
        None => 0,
    };
    let corrupt = |reason: String| corrupt(revision, reason);

    let tokens = tokens
        .ok_or_else(|| corrupt("missing tokens".to_string()))?
        .parse::<f64>()
        .map_err(|e| corrupt(format!("tokens: {}", e)))?;
    if !tokens.is_finite() {
        return Err(corrupt(format!("tokens not finite: {}", tokens)));
    }

    let last_refill_ms = last_refill_ms
        .ok_or_else(|| corrupt("missing last_refill_ms".to_string()))?
        .parse::<i64>()
        .map_err(|e| corrupt(format!("last_refill_ms: {}", e)))?;

    Ok(Some(BucketRecord {
        tokens,
        last_refill_ms,
        revision,
    }))
}
