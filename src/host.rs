//! Host-control surface consumed by the core (§6).
//!
//! The popup/settings UI, page-injection plumbing, and the concrete
//! binding to a video player or extension storage are out of scope
//! (§1); this module defines the trait boundary a host implements, the
//! way `thaumic-core::context::IpDetector` decouples local-IP detection
//! from its concrete auto-detect/explicit backends.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Returns the player's current playback time in seconds.
///
/// Synchronous if the caller runs in the player's execution context;
/// otherwise the host can implement this over an async RPC and block only
/// the calling task, not the render thread (§5 suspension points).
#[async_trait]
pub trait VideoClock: Send + Sync {
    /// Current playback time, seconds.
    async fn current_time_sec(&self) -> f64;
}

/// A fixed clock used for tests and for hosts where the player always
/// reports a known time.
pub struct FixedClock(pub f64);

#[async_trait]
impl VideoClock for FixedClock {
    async fn current_time_sec(&self) -> f64 {
        self.0
    }
}

/// Async get/set/remove over string keys (§6 kvStore).
///
/// Values are opaque strings; the credential store is the only caller that
/// assigns them cryptographic meaning.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> std::io::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> std::io::Result<()>;
    async fn remove(&self, key: &str) -> std::io::Result<()>;
}

/// In-memory `KvStore`, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> std::io::Result<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

/// File-backed `KvStore`: one JSON object on disk, guarded by a mutex.
///
/// Suitable for the standalone-server / desktop embedding this crate is
/// designed for; a browser-extension host would instead adapt its own
/// `storage.local`-equivalent to this trait.
pub struct FileKvStore {
    path: std::path::PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileKvStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn flush(&self, cache: &HashMap<String, String>) -> std::io::Result<()> {
        let raw = serde_json::to_string_pretty(cache)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&self.path, raw)
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        Ok(self.cache.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(key.to_string(), value.to_string());
        self.flush(&cache)
    }

    async fn remove(&self, key: &str) -> std::io::Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.remove(key);
        self.flush(&cache)
    }
}
