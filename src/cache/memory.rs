//! In-process cache and lock stores.
//!
//! Suitable for a single server process and for tests. Time comes from
//! `tokio::time`, so paused-clock tests can step past TTLs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheStore, DEFAULT_STALE_WINDOW, LockStore, LockToken, StoreResult};
use crate::error::StoreError;

pub const DEFAULT_MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    fresh_until: Instant,
    evict_at: Instant,
}

pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
    stale_window: Duration,
    max_entries: usize,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_WINDOW)
    }
}

impl MemoryCacheStore {
    pub fn new(stale_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_window,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, key: &str, allow_stale: bool) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if now >= entry.evict_at {
            entries.remove(key);
            return Ok(None);
        }
        if now < entry.fresh_until || allow_stale {
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.read(key, false)
    }

    async fn get_allowing_stale(&self, key: &str) -> StoreResult<Option<String>> {
        self.read(key, true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let now = Instant::now();

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| e.evict_at > now);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.evict_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        let fresh_until = now + ttl;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                fresh_until,
                evict_at: fresh_until + self.stale_window,
            },
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryLockStore {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        let now = Instant::now();
        if let Some((_, expires_at)) = held.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = LockToken::new(key);
        held.insert(key.to_string(), (token.id().to_string(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, token: &LockToken) -> StoreResult<()> {
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        if held.get(token.key()).is_some_and(|(id, _)| id == token.id()) {
            held.remove(token.key());
        }
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("Lock poisoned".to_string())
}
