// Cache layer for CaseStrainer
// Key-value store abstraction, content-addressed citation caches, and the
// at-most-one-builder protocol for in-flight lookups

use crate::domain::{CitationLookup, SCHEMA_VERSION};
use crate::services::pipeline::PipelineOutput;
use crate::utils::crypto::sha256_hex_str;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Verified entries outlive unverified ones by design: clearing negatives
/// must never lose a positive result.
pub const VERIFIED_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
pub const UNVERIFIED_TTL: Duration = Duration::from_secs(24 * 3600);
pub const EXTRACTION_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub const VERIFIED_PREFIX: &str = "verified/";
pub const UNVERIFIED_PREFIX: &str = "unverified/";
pub const EXTRACTION_PREFIX: &str = "extraction/";
pub const JOBS_PREFIX: &str = "jobs/";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Minimal key-value contract shared by jobs, queue claims, and citation
/// caches. `REDIS_URL` selects the backend at startup.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Compare-and-swap on the full current value. `expected = None` means
    /// "create only if absent". Returns false when the current value did not
    /// match and nothing was written.
    async fn put_if(
        &self,
        key: &str,
        value: &str,
        expected: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove expired entries under a prefix; returns how many went away.
    async fn delete_expired(&self, prefix: &str) -> Result<usize, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (String, Option<DateTime<Utc>>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(entry: &(String, Option<DateTime<Utc>>)) -> bool {
        entry.1.map_or(false, |at| at <= Utc::now())
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|t| Utc::now() + chrono::Duration::from_std(t).unwrap_or(chrono::Duration::zero()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !Self::expired(e))
            .map(|e| e.0.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value.to_string(), Self::expiry(ttl)));
        Ok(())
    }

    async fn put_if(
        &self,
        key: &str,
        value: &str,
        expected: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).filter(|e| !Self::expired(e)).map(|e| e.0.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Self::expiry(ttl)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !Self::expired(e))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_expired(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && Self::expired(e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!("Connecting key-value store: {}", url);

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Backend(format!("invalid store URL: {}", e)))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(format!("connect failed: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Backend(format!("schema init failed: {}", e)))?;

        Ok(Self { pool })
    }

    fn expiry(ttl: Option<Duration>) -> Option<String> {
        ttl.map(|t| {
            (Utc::now() + chrono::Duration::from_std(t).unwrap_or(chrono::Duration::zero()))
                .to_rfc3339()
        })
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Self::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Self::expiry(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn put_if(
        &self,
        key: &str,
        value: &str,
        expected: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let result = match expected {
            Some(expected) => sqlx::query(
                r#"
                UPDATE kv SET value = ?, expires_at = ?
                WHERE key = ? AND value = ?
                  AND (expires_at IS NULL OR expires_at > ?)
                "#,
            )
            .bind(value)
            .bind(Self::expiry(ttl))
            .bind(key)
            .bind(expected)
            .bind(Self::now())
            .execute(&self.pool)
            .await,
            None => {
                // Create-if-absent; an expired row counts as absent.
                sqlx::query("DELETE FROM kv WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?")
                    .bind(key)
                    .bind(Self::now())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                sqlx::query("INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?, ?, ?)")
                    .bind(key)
                    .bind(value)
                    .bind(Self::expiry(ttl))
                    .execute(&self.pool)
                    .await
            }
        };

        let result = result.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            r#"
            SELECT key FROM kv
            WHERE key LIKE ? ESCAPE '\'
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            "#,
        )
        .bind(pattern)
        .bind(Self::now())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get::<String, _>("key")).collect())
    }

    async fn delete_expired(&self, prefix: &str) -> Result<usize, StoreError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let result = sqlx::query(
            r#"DELETE FROM kv WHERE key LIKE ? ESCAPE '\' AND expires_at IS NOT NULL AND expires_at <= ?"#,
        )
        .bind(pattern)
        .bind(Self::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// Build the store selected by the configured URL.
pub async fn open_store(url: &str) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    if url == "memory:" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(SqliteStore::connect(url).await?))
    }
}

// ============================================================================
// Versioned envelopes
// ============================================================================

/// Every persisted value is self-describing: a schema version wraps the
/// payload, and mismatched versions read as cache misses.
#[derive(Debug, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub schema: u32,
    pub payload: T,
}

pub fn encode_versioned<T: Serialize>(payload: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&Versioned {
        schema: SCHEMA_VERSION,
        payload,
    })?)
}

pub fn decode_versioned<T: DeserializeOwned>(raw: &str) -> Option<T> {
    match serde_json::from_str::<Versioned<T>>(raw) {
        Ok(v) if v.schema == SCHEMA_VERSION => Some(v.payload),
        Ok(v) => {
            debug!("Discarding cache entry with schema {}", v.schema);
            None
        }
        Err(e) => {
            warn!("Undecodable cache entry: {}", e);
            None
        }
    }
}

// ============================================================================
// Citation cache
// ============================================================================

/// Payload stored per fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: CitationLookup,
    pub stored_at: DateTime<Utc>,
    /// Which backend produced the entry.
    pub source: String,
    pub verified: bool,
}

/// Outcome of claiming the build slot for a fingerprint.
pub enum BuildSlot {
    /// Caller owns the build; it must call the guard's finish (or drop it)
    /// so waiters wake up.
    Owner(BuildGuard),
    /// Another task is building; await the receiver then re-read the cache.
    Waiter(watch::Receiver<bool>),
}

pub struct BuildGuard {
    key: String,
    locks: Arc<Mutex<HashMap<String, (watch::Sender<bool>, watch::Receiver<bool>)>>>,
}

impl BuildGuard {
    /// Release the slot and wake waiters. Dropping the guard does the same.
    pub async fn finish(self) {}
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        let key = self.key.clone();
        let locks = Arc::clone(&self.locks);
        // The guard can drop outside an async context during unwinding, so
        // hand the cleanup to the runtime when one is available.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut locks = locks.lock().await;
                if let Some((tx, _)) = locks.remove(&key) {
                    let _ = tx.send(true);
                }
            });
        }
    }
}

/// Content-addressed cache for verification results and extraction output.
/// Verified and unverified entries live in disjoint namespaces so clearing
/// negatives never loses a positive result.
pub struct CitationCache {
    store: Arc<dyn KeyValueStore>,
    locks: Arc<Mutex<HashMap<String, (watch::Sender<bool>, watch::Receiver<bool>)>>>,
}

impl CitationCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stable hash over the normalized citation text plus the schema
    /// version. Different schema versions never collide.
    pub fn fingerprint(normalized_citation: &str) -> String {
        sha256_hex_str(&format!("v{}:{}", SCHEMA_VERSION, normalized_citation))
    }

    pub fn text_hash(text: &str) -> String {
        sha256_hex_str(text)
    }

    pub async fn get_verified(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.read_entry(&format!("{}{}", VERIFIED_PREFIX, fingerprint))
            .await
    }

    pub async fn get_unverified(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.read_entry(&format!("{}{}", UNVERIFIED_PREFIX, fingerprint))
            .await
    }

    async fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(Some(raw)) => decode_versioned(&raw),
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    pub async fn put_verified(
        &self,
        fingerprint: &str,
        payload: CitationLookup,
        source: &str,
    ) -> Result<(), StoreError> {
        let entry = CacheEntry {
            payload,
            stored_at: Utc::now(),
            source: source.to_string(),
            verified: true,
        };
        self.store
            .put(
                &format!("{}{}", VERIFIED_PREFIX, fingerprint),
                &encode_versioned(&entry)?,
                Some(VERIFIED_TTL),
            )
            .await
    }

    pub async fn put_unverified(
        &self,
        fingerprint: &str,
        payload: CitationLookup,
        source: &str,
    ) -> Result<(), StoreError> {
        let entry = CacheEntry {
            payload,
            stored_at: Utc::now(),
            source: source.to_string(),
            verified: false,
        };
        self.store
            .put(
                &format!("{}{}", UNVERIFIED_PREFIX, fingerprint),
                &encode_versioned(&entry)?,
                Some(UNVERIFIED_TTL),
            )
            .await
    }

    /// Claim the build slot for a fingerprint. At most one concurrent
    /// database call happens per fingerprint across the process; losers wait
    /// on the winner's completion signal and re-read the cache.
    pub async fn begin_build(&self, fingerprint: &str) -> BuildSlot {
        let mut locks = self.locks.lock().await;
        if let Some((_, rx)) = locks.get(fingerprint) {
            return BuildSlot::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(false);
        locks.insert(fingerprint.to_string(), (tx, rx));
        BuildSlot::Owner(BuildGuard {
            key: fingerprint.to_string(),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Cache a full pipeline output keyed by the input text hash, so
    /// identical inputs skip the stages up to verification.
    pub async fn put_extraction(
        &self,
        text_hash: &str,
        output: &PipelineOutput,
    ) -> Result<(), StoreError> {
        self.store
            .put(
                &format!("{}{}", EXTRACTION_PREFIX, text_hash),
                &encode_versioned(output)?,
                Some(EXTRACTION_TTL),
            )
            .await
    }

    pub async fn get_extraction(&self, text_hash: &str) -> Option<PipelineOutput> {
        match self
            .store
            .get(&format!("{}{}", EXTRACTION_PREFIX, text_hash))
            .await
        {
            Ok(Some(raw)) => decode_versioned(&raw),
            _ => None,
        }
    }

    /// Drop every unverified entry, expired or not. Verified entries are
    /// untouched. Returns the number cleared.
    #[instrument(skip(self))]
    pub async fn clear_unverified(&self) -> Result<usize, StoreError> {
        let keys = self.store.scan_prefix(UNVERIFIED_PREFIX).await?;
        let mut cleared = 0;
        for key in keys {
            if self.store.delete(&key).await? {
                cleared += 1;
            }
        }
        info!("Cleared {} unverified cache entries", cleared);
        Ok(cleared)
    }

    /// Background compaction: remove expired unverified entries and stale
    /// extraction artifacts. Never deletes verified entries.
    #[instrument(skip(self))]
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let negatives = self.store.delete_expired(UNVERIFIED_PREFIX).await?;
        let extractions = self.store.delete_expired(EXTRACTION_PREFIX).await?;
        if negatives + extractions > 0 {
            info!(
                "Compaction removed {} negative and {} extraction entries",
                negatives, extractions
            );
        }
        Ok(negatives + extractions)
    }
}
