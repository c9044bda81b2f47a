#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Shared key-value store used for caching, idempotency results, and
//! status write-back. The store is never the system of record: every
//! mutation on the authoritative stores invalidates its dependent keys
//! here, and readers must tolerate misses.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

pub mod keys;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// TTL policy by data volatility.
pub mod ttl {
    use std::time::Duration;

    pub const BALANCE: Duration = Duration::from_secs(30);
    pub const ACCOUNT: Duration = Duration::from_secs(2 * 60);
    pub const JOURNAL: Duration = Duration::from_secs(5 * 60);
    pub const IDEMPOTENCY: Duration = Duration::from_secs(24 * 60 * 60);
    pub const STATUS: Duration = Duration::from_secs(24 * 60 * 60);
}

/// An entry queued for a pipelined write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub value: String,
    pub ttl: Option<Duration>,
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()>;

    /// Pipelined multi-set; implementations issue one round trip.
    async fn set_many(&self, entries: Vec<StoreEntry>) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Key-space scan removing every key under `prefix`. Returns the
    /// number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> CacheResult<usize>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;
}

/// Reads a JSON-encoded value, treating decode failures as misses so a
/// poisoned cache entry can never wedge a read path.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> CacheResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(serde_json::from_str(&raw).ok()),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    store: &dyn SharedStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CacheResult<()> {
    let encoded =
        serde_json::to_string(value).map_err(|err| CacheError::Encoding(err.to_string()))?;
    store.set(key, encoded, ttl).await
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// In-memory [`SharedStore`] with lazy TTL expiry. Stands in for the
/// shared store in tests and embedded deployments.
#[derive(Default)]
pub struct InMemorySharedStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemorySharedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every expired entry eagerly. Lazy expiry on read keeps
    /// correctness; this keeps the map from growing without bound in
    /// long-lived embedders.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_expired(now));
        before - guard.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        {
            let guard = self.entries.read().await;
            match guard.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: upgrade to a write lock and drop the entry.
        let mut guard = self.entries.write().await;
        if let Some(entry) = guard.get(key)
            && entry.is_expired(now)
        {
            guard.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let mut guard = self.entries.write().await;
        guard.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_many(&self, entries: Vec<StoreEntry>) -> CacheResult<()> {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        for entry in entries {
            guard.insert(
                entry.key,
                Entry {
                    value: entry.value,
                    expires_at: entry.ttl.map(|ttl| now + ttl),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut guard = self.entries.write().await;
        guard.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok(before - guard.len())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
