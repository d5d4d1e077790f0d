//! Key-value persistence used by learning policies.
//!
//! Backends are injected as `Arc<dyn Storage>`; [`MemoryStorage`] is the
//! default. All operations are async and may fail; the policy layer does not
//! retry. Wrap a backend in [`RetryingStorage`] to add bounded retries.
//!
//! Access is best-effort: there is no compare-and-swap, so two writers that
//! read the same value and write back derived values lose one update.

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};

/// Exported storage contents, ordered by key.
pub type StorageDump = BTreeMap<String, Value>;

/// Async key-value store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the stored value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Stores `value`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn clear(&self) -> StorageResult<()>;

    /// Full dump of the store. `Ok(None)` means the backend cannot export.
    async fn export(&self) -> StorageResult<Option<StorageDump>> {
        Ok(None)
    }

    /// Bulk load; entries overwrite existing keys and never expire.
    async fn import(&self, _entries: StorageDump) -> StorageResult<()> {
        Err(StorageError::Unsupported("import"))
    }
}

/// Typed helpers on top of any [`Storage`].
#[async_trait]
pub trait StorageExt: Storage {
    async fn get_as<T>(&self, key: &str) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|source| StorageError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn set_as<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> StorageResult<()>
    where
        T: Serialize + Sync,
    {
        let v = serde_json::to_value(value).map_err(|source| StorageError::Decode {
            key: key.to_string(),
            source,
        })?;
        self.set(key, v, ttl).await
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process storage backed by a `HashMap`. Expired entries are dropped
/// lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.is_live(now) => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // expired: evict under the write lock
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn export(&self) -> StorageResult<Option<StorageDump>> {
        let now = Instant::now();
        let dump = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        Ok(Some(dump))
    }

    async fn import(&self, entries: StorageDump) -> StorageResult<()> {
        let mut guard = self.entries.write().await;
        for (key, value) in entries {
            guard.insert(
                key,
                Entry {
                    value,
                    expires_at: None,
                },
            );
        }
        Ok(())
    }
}

/// Retry settings for [`RetryingStorage`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up to 25% random jitter, capped at `max_delay`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 4);
        backoff + Duration::from_millis(jitter_ms)
    }
}

/// Decorator that retries transient ([`StorageError::Backend`]) failures.
///
/// Decode and unsupported-operation errors are returned immediately.
#[derive(Debug)]
pub struct RetryingStorage<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Storage> RetryingStorage<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = StorageResult<T>> + Send,
        T: Send,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(StorageError::Backend(msg)) if attempt < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    crate::log_warn!(
                        "storage {} failed (attempt {}/{}): {}; retrying in {:?}",
                        op,
                        attempt,
                        attempts,
                        msg,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: Storage> Storage for RetryingStorage<S> {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.retry("get", || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        self.retry("set", || self.inner.set(key, value.clone(), ttl))
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.retry("delete", || self.inner.delete(key)).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.retry("clear", || self.inner.clear()).await
    }

    async fn export(&self) -> StorageResult<Option<StorageDump>> {
        self.retry("export", || self.inner.export()).await
    }

    async fn import(&self, entries: StorageDump) -> StorageResult<()> {
        self.retry("import", || self.inner.import(entries.clone()))
            .await
    }
}
