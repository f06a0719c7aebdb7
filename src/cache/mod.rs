//! Shared cache and lock stores used by the gateway.
//!
//! Both are treated as external services: the gateway only talks to them
//! through [`CacheStore`] and [`LockStore`], so the same code runs against
//! the in-process stores (`memory`) or a directory shared between processes
//! (`file`).
//!
//! - `key`: deterministic cache keys and filter fingerprints
//! - `memory`: in-process TTL cache and lock table
//! - `file`: directory-backed cache entries and lock files

pub mod file;
pub mod key;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StoreError;

pub use file::{FileCacheStore, FileLockStore};
pub use key::{cache_key, filters_fingerprint, lock_key};
pub use memory::{MemoryCacheStore, MemoryLockStore};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// How long an expired entry stays readable through `get_allowing_stale`.
pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Entry within its TTL.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Entry past its TTL, as long as it is still inside the stale window.
    async fn get_allowing_stale(&self, key: &str) -> StoreResult<Option<String>>;

    /// Stores the whole value or nothing.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
}

/// Opaque proof of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    id: String,
}

impl LockToken {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub(crate) fn from_parts(key: &str, id: &str) -> Self {
        Self {
            key: key.to_string(),
            id: id.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Single non-blocking attempt. The lock expires by itself after `ttl`.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>>;

    /// Releases the lock if `token` still owns it.
    async fn release(&self, token: &LockToken) -> StoreResult<()>;

    /// Retries `try_acquire` until `max_wait` has passed. `None` means busy.
    async fn acquire(&self, key: &str, ttl: Duration, max_wait: Duration) -> StoreResult<Option<LockToken>> {
        let deadline = Instant::now() + max_wait;
        loop {
            if let Some(token) = self.try_acquire(key, ttl).await? {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// Held lock. `release` should be awaited on the normal path; if the guard
/// is dropped instead (early return, panic, cancelled future) the release is
/// spawned onto the current runtime, and failing that the lock's TTL frees it.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    token: Option<LockToken>,
}

impl LockGuard {
    pub async fn acquire(
        store: Arc<dyn LockStore>,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> StoreResult<Option<Self>> {
        let token = store.acquire(key, ttl, max_wait).await?;
        Ok(token.map(|token| Self {
            store,
            token: Some(token),
        }))
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.store.release(&token).await {
                tracing::warn!("Failed to release lock {}: {}", token.key(), e);
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    if let Err(e) = store.release(&token).await {
                        tracing::warn!("Failed to release lock {}: {}", token.key(), e);
                    }
                });
            }
            Err(_) => {
                tracing::warn!("No runtime to release lock {}; it will expire", token.key());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let ttl = Duration::from_secs(30);
        {
            let guard = LockGuard::acquire(store.clone(), "k", ttl, Duration::ZERO)
                .await
                .unwrap();
            assert!(guard.is_some());
            assert!(store.try_acquire("k", ttl).await.unwrap().is_none());
        }
        // The drop-path release runs on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.try_acquire("k", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn explicit_release_frees_the_key() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let ttl = Duration::from_secs(30);
        let guard = LockGuard::acquire(store.clone(), "k", ttl, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        guard.release().await;
        assert!(store.try_acquire("k", ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_at_most_max_wait() {
        let store = MemoryLockStore::new();
        let ttl = Duration::from_secs(30);
        let _held = store.try_acquire("k", ttl).await.unwrap().unwrap();

        let start = Instant::now();
        let second = store.acquire("k", ttl, Duration::from_secs(2)).await.unwrap();
        assert!(second.is_none());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    }
}
