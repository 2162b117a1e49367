//! Object and lock store capabilities
//!
//! The persistent graph and uploaded artifacts live in an object store
//! behind two small capabilities: `ObjectStore` (get/put/delete) and
//! `LockStore` (acquire/release/renew with a TTL so a crashed run cannot
//! hold a lock forever). `MemoryStore` backs tests; `FileStore` backs
//! local runs under the cache directory.

pub mod persist;

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::context::ENV_CACHE_DIR;
use crate::error::{Result, StratusError};

/// Minimal blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// None when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns a locator for the stored object.
    async fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<String>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Proof of lock ownership; required to mutate the locked object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

/// TTL-based advisory locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Errors with `GraphLockHeld` when another holder's lock is live.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken>;

    async fn release(&self, token: &LockToken) -> Result<()>;

    /// Extend the TTL; errors with `StaleLockToken` if ownership was lost.
    async fn renew(&self, token: &LockToken) -> Result<()>;
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    expires_at: u64,
    ttl_secs: u64,
}

impl LockRecord {
    fn live(&self) -> bool {
        self.expires_at > now_unix()
    }
}

// ═══════════════════════════════════════════════════════════════
// MemoryStore
// ═══════════════════════════════════════════════════════════════

/// In-memory store implementing both capabilities.
#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<String, Vec<u8>>,
    locks: DashMap<String, LockRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct object access for test assertions.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.clone())
    }

    /// True when a live lock exists on the key.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.get(key).map(|l| l.live()).unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.get(key).map(|o| o.clone()))
    }

    async fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<String> {
        self.objects.insert(key.to_string(), body.to_vec());
        Ok(format!("memory://{}", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken> {
        let mut entry = self.locks.entry(key.to_string()).or_insert(LockRecord {
            token: String::new(),
            expires_at: 0,
            ttl_secs: 0,
        });
        if entry.live() {
            return Err(StratusError::GraphLockHeld { key: key.into() });
        }
        let token = uuid::Uuid::new_v4().to_string();
        *entry = LockRecord {
            token: token.clone(),
            expires_at: now_unix() + ttl.as_secs(),
            ttl_secs: ttl.as_secs(),
        };
        Ok(LockToken {
            key: key.into(),
            token,
        })
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        match self.locks.get(&token.key) {
            Some(record) if record.token == token.token => {
                drop(record);
                self.locks.remove(&token.key);
                Ok(())
            }
            _ => Err(StratusError::StaleLockToken {
                key: token.key.clone(),
            }),
        }
    }

    async fn renew(&self, token: &LockToken) -> Result<()> {
        match self.locks.get_mut(&token.key) {
            Some(mut record) if record.token == token.token => {
                record.expires_at = now_unix() + record.ttl_secs;
                Ok(())
            }
            _ => Err(StratusError::StaleLockToken {
                key: token.key.clone(),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// FileStore
// ═══════════════════════════════════════════════════════════════

/// Filesystem-backed store rooted at the cache directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Rooted at `STRATUS_CACHE_DIR`, else the platform cache dir.
    pub fn default_location() -> Self {
        let root = std::env::var(ENV_CACHE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("stratus")
            });
        Self::new(root)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.lock", key))
    }

    fn read_lock(&self, key: &str) -> Option<LockRecord> {
        let raw = std::fs::read(self.lock_path(key)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn write_lock(&self, key: &str, record: &LockRecord) -> Result<()> {
        let path = self.lock_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(record)?)?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.object_path(key)) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, body: &[u8], _content_type: &str) -> Result<String> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, body)?;
        Ok(format!("file://{}", path.display()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.object_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LockStore for FileStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken> {
        if let Some(existing) = self.read_lock(key) {
            if existing.live() {
                return Err(StratusError::GraphLockHeld { key: key.into() });
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        self.write_lock(
            key,
            &LockRecord {
                token: token.clone(),
                expires_at: now_unix() + ttl.as_secs(),
                ttl_secs: ttl.as_secs(),
            },
        )?;
        Ok(LockToken {
            key: key.into(),
            token,
        })
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        match self.read_lock(&token.key) {
            Some(record) if record.token == token.token => {
                std::fs::remove_file(self.lock_path(&token.key))?;
                Ok(())
            }
            _ => Err(StratusError::StaleLockToken {
                key: token.key.clone(),
            }),
        }
    }

    async fn renew(&self, token: &LockToken) -> Result<()> {
        match self.read_lock(&token.key) {
            Some(mut record) if record.token == token.token => {
                record.expires_at = now_unix() + record.ttl_secs;
                self.write_lock(&token.key, &record)
            }
            _ => Err(StratusError::StaleLockToken {
                key: token.key.clone(),
            }),
        }
    }
}
