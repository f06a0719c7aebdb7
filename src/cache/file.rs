//! Directory-backed cache and lock stores.
//!
//! Several gateway processes pointed at the same directory share entries and
//! locks. Cache entries are written to a temporary file and renamed into
//! place, so readers see either the previous entry or the complete new one.
//! Locks are published by hard-linking a fully written temporary file, so a
//! lock file is either complete or absent. An expired lock file is moved
//! aside and re-created by whoever notices it first.
//!
//! Layout:
//! - `<root>/entries/<sha256(key)>.json`
//! - `<root>/locks/<sha256(key)>.lock`

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{CacheStore, DEFAULT_STALE_WINDOW, LockStore, LockToken, StoreResult};

#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
    key: String,
    /// Unix milliseconds.
    fresh_until: i64,
    evict_at: i64,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    id: String,
    expires_at: i64,
}

#[derive(Debug)]
enum LockState {
    Free,
    Held(LockFile),
    /// Present but not a lock body; carries the file's mtime.
    Unreadable(SystemTime),
}

impl LockState {
    fn id(&self) -> Option<&str> {
        match self {
            LockState::Held(lock) => Some(&lock.id),
            _ => None,
        }
    }
}

fn hashed_name(key: &str, ext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}.{}", hasher.finalize(), ext)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub struct FileCacheStore {
    dir: PathBuf,
    stale_window: Duration,
}

impl FileCacheStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        Self::open_with_stale_window(root, DEFAULT_STALE_WINDOW).await
    }

    pub async fn open_with_stale_window<P: AsRef<Path>>(root: P, stale_window: Duration) -> StoreResult<Self> {
        let dir = root.as_ref().join("entries");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, stale_window })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hashed_name(key, "json"))
    }

    async fn read(&self, key: &str, allow_stale: bool) -> StoreResult<Option<String>> {
        let path = self.path_for(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: EntryFile = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Discarding unreadable cache entry {}: {}", path.display(), e);
                remove_quietly(&path).await;
                return Ok(None);
            }
        };
        // Hash collision or a foreign file in the directory.
        if entry.key != key {
            return Ok(None);
        }

        let now = now_millis();
        if now >= entry.evict_at {
            remove_quietly(&path).await;
            return Ok(None);
        }
        if now < entry.fresh_until || allow_stale {
            return Ok(Some(entry.value));
        }
        Ok(None)
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.read(key, false).await
    }

    async fn get_allowing_stale(&self, key: &str) -> StoreResult<Option<String>> {
        self.read(key, true).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = now_millis();
        let fresh_until = now.saturating_add(millis(ttl));
        let entry = EntryFile {
            key: key.to_string(),
            fresh_until,
            evict_at: fresh_until.saturating_add(millis(self.stale_window)),
            value: value.to_string(),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let dir = root.as_ref().join("locks");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hashed_name(key, "lock"))
    }

    /// Writes the lock body to a private file, then hard-links it into
    /// place. The link either publishes a complete lock or fails with
    /// `AlreadyExists`, so a lock file is never observed half-written.
    async fn create(&self, path: &Path, token: &LockToken, ttl: Duration) -> StoreResult<bool> {
        let contents = serde_json::to_vec(&LockFile {
            id: token.id().to_string(),
            expires_at: now_millis().saturating_add(millis(ttl)),
        })?;
        let tmp = path.with_extension(format!("{}.tmp", token.id()));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&contents).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }

        let published = fs::hard_link(&tmp, path).await;
        remove_quietly(&tmp).await;
        match published {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_lock(path: &Path) -> StoreResult<LockState> {
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(e.into()),
        };
        if let Ok(lock) = serde_json::from_slice::<LockFile>(&raw) {
            return Ok(LockState::Held(lock));
        }
        match fs::metadata(path).await {
            Ok(meta) => Ok(LockState::Unreadable(meta.modified()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LockState::Free),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves an expired lock file aside. Returns false if the file turned
    /// out to be a different, live lock, which is then put back.
    async fn take_over(&self, path: &Path, expired_id: Option<&str>) -> StoreResult<bool> {
        let tombstone = path.with_extension(format!("{}.expired", uuid::Uuid::new_v4()));
        match fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved = Self::read_lock(&tombstone).await?;
        if moved.id() == expired_id {
            remove_quietly(&tombstone).await;
            return Ok(true);
        }

        // The lock was re-created between our read and rename: restore it.
        let restored = fs::hard_link(&tombstone, path).await;
        remove_quietly(&tombstone).await;
        match restored {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(
                    "Lock {} was claimed by another caller while being restored",
                    path.display()
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let path = self.path_for(key);
        let token = LockToken::new(key);

        if self.create(&path, &token, ttl).await? {
            return Ok(Some(token));
        }

        let existing = Self::read_lock(&path).await?;
        let expired = match &existing {
            // Released since our attempt.
            LockState::Free => return Ok(self.create(&path, &token, ttl).await?.then_some(token)),
            LockState::Held(lock) => lock.expires_at <= now_millis(),
            // No expiry to read; only its age can expire it.
            LockState::Unreadable(modified) => modified.elapsed().is_ok_and(|age| age >= ttl),
        };
        if !expired {
            return Ok(None);
        }

        tracing::debug!("Taking over expired lock for {}", key);
        if !self.take_over(&path, existing.id()).await? {
            return Ok(None);
        }
        Ok(self.create(&path, &token, ttl).await?.then_some(token))
    }

    async fn release(&self, token: &LockToken) -> StoreResult<()> {
        let path = self.path_for(token.key());
        match Self::read_lock(&path).await? {
            LockState::Held(lock) if lock.id == token.id() => {
                match fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(()),
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
