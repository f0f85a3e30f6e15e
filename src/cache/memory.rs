use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CacheError, CacheStorage, CacheStore, CachedImage};

#[derive(Default)]
struct Entries {
    images: HashMap<String, (u64, CachedImage)>,
    next_seq: u64,
}

// Image store kept in process memory; lost on restart
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CachedImage>, CacheError> {
        let entries = self.entries.read();
        Ok(entries.images.get(key).map(|(_, image)| image.clone()))
    }

    async fn put(&self, key: &str, entry: CachedImage) -> Result<(), CacheError> {
        let mut entries = self.entries.write();
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.images.insert(key.to_string(), (seq, entry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().images.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let entries = self.entries.read();
        let mut keys: Vec<(u64, &String)> = entries.images.iter().map(|(key, (seq, _))| (*seq, key)).collect();
        keys.sort_unstable();
        Ok(keys.into_iter().map(|(_, key)| key.clone()).collect())
    }

    async fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.entries.read().images.values().map(|(_, image)| image.size()).sum())
    }
}

/// Named in-memory namespaces.
#[derive(Default)]
pub struct MemoryStorage {
    namespaces: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, CacheError> {
        let mut namespaces = self.namespaces.write();
        let store: Arc<dyn CacheStore> = namespaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone();
        Ok(store)
    }

    async fn names(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.namespaces.write().remove(name).is_some())
    }
}
