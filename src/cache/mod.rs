mod disk;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use disk::{DiskStorage, DiskStore};
pub use memory::{MemoryStorage, MemoryStore};

/// Cache-Control attached to every resized image.
pub const LONG_CACHE_CONTROL: &str = "public, max-age=31536000";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Invalid cache namespace: {0}")]
    InvalidNamespace(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub data: Vec<u8>,
    pub content_type: String,
    pub cache_control: String,
}

impl CachedImage {
    pub fn new(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            data,
            content_type: content_type.into(),
            cache_control: LONG_CACHE_CONTROL.to_string(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// One cache namespace: a keyed store of image blobs.
///
/// `keys` enumerates in insertion order; replacing a key moves it to the end.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedImage>, CacheError>;
    async fn put(&self, key: &str, entry: CachedImage) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
    async fn total_size(&self) -> Result<u64, CacheError>;
}

/// A set of named cache namespaces.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, CacheError>;
    async fn names(&self) -> Result<Vec<String>, CacheError>;
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    pub max_bytes: u64,
    pub fraction: f64,
}

impl EvictionPolicy {
    /// How many entries one pass removes out of `len`. Always at least one.
    pub fn batch_size(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        ((len as f64 * self.fraction).ceil() as usize).clamp(1, len)
    }
}

/// Resized-image cache bound to the current namespace.
///
/// Store failures never reach the caller: reads degrade to misses and writes
/// to no-ops.
#[derive(Clone)]
pub struct ImageCache {
    store: Arc<dyn CacheStore>,
    version: String,
    policy: EvictionPolicy,
}

impl ImageCache {
    pub fn new(store: Arc<dyn CacheStore>, version: impl Into<String>, policy: EvictionPolicy) -> Self {
        Self {
            store,
            version: version.into(),
            policy,
        }
    }

    /// Drop every namespace except `version`, then open it.
    pub async fn activate(
        storage: &dyn CacheStorage,
        version: &str,
        policy: EvictionPolicy,
    ) -> Result<Self, CacheError> {
        for name in storage.names().await? {
            if name != version {
                log::info!("Deleting stale image cache namespace '{}'", name);
                if let Err(e) = storage.delete(&name).await {
                    log::warn!("Failed to delete cache namespace '{}': {}", name, e);
                }
            }
        }

        let store = storage.open(version).await?;
        Ok(Self::new(store, version, policy))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn get_image(&self, key: &str) -> Option<CachedImage> {
        match self.store.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Cache read failed for {}, treating as miss: {}", key, e);
                None
            }
        }
    }

    pub async fn store_image(&self, key: &str, entry: CachedImage) -> bool {
        match self.store.put(key, entry).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Cache write failed for {}: {}", key, e);
                false
            }
        }
    }

    /// Bulk-evict the oldest entries when the store is over budget.
    ///
    /// Returns the number of entries deleted.
    pub async fn enforce_budget(&self) -> usize {
        match self.try_enforce_budget().await {
            Ok(evicted) => evicted,
            Err(e) => {
                log::warn!("Cache eviction failed: {}", e);
                0
            }
        }
    }

    async fn try_enforce_budget(&self) -> Result<usize, CacheError> {
        let total = self.store.total_size().await?;
        if total <= self.policy.max_bytes {
            return Ok(0);
        }

        let keys = self.store.keys().await?;
        let batch = self.policy.batch_size(keys.len());
        log::info!(
            "Image cache at {} bytes exceeds budget of {} bytes, evicting {}/{} entries",
            total,
            self.policy.max_bytes,
            batch,
            keys.len()
        );

        let mut evicted = 0;
        for key in keys.iter().take(batch) {
            // Another pass may already have removed it
            if self.store.delete(key).await? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Number of entries and their aggregate size.
    pub async fn stats(&self) -> Result<(usize, u64), CacheError> {
        let keys = self.store.keys().await?;
        let total = self.store.total_size().await?;
        Ok((keys.len(), total))
    }
}
