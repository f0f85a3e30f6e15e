use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{CacheError, CacheStorage, CacheStore, CachedImage};

const DATA_EXT: &str = "bin";
const META_EXT: &str = "json";
const TMP_EXT: &str = "tmp";
// Marks a directory as a namespace created by this proxy
const NAMESPACE_MARKER: &str = ".atlas-image-cache";

/// Sidecar metadata written next to every image body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    content_type: String,
    cache_control: String,
    size: u64,
    seq: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    stem: String,
    content_type: String,
    cache_control: String,
    size: u64,
    seq: u64,
}

#[derive(Default)]
struct Index {
    entries: HashMap<String, IndexEntry>,
    next_seq: u64,
}

/// Image store persisted as files in one namespace directory.
///
/// Each entry is `<md5(key)>.bin` plus `<md5(key)>.json`. Both are written to
/// temporary files and renamed into place, so a crash never leaves a
/// half-written body that the index would serve.
pub struct DiskStore {
    dir: PathBuf,
    index: RwLock<Index>,
}

fn file_stem(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

async fn remove_if_exists(path: &Path) -> Result<bool, CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomically(path: &Path, tmp: &Path, contents: &[u8]) -> Result<(), CacheError> {
    if let Err(e) = fs::write(tmp, contents).await {
        let _ = fs::remove_file(tmp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(tmp, path).await {
        let _ = fs::remove_file(tmp).await;
        return Err(e.into());
    }
    Ok(())
}

impl DiskStore {
    /// Open a namespace directory, rebuilding the index from its metadata.
    ///
    /// Leftover temporary files and entries whose body is missing or of the
    /// wrong size are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut index = Index::default();
        let mut stale = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;

        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(TMP_EXT) => stale.push(path),
                Some(META_EXT) => match Self::load_entry(&path).await {
                    Some((key, entry)) => {
                        index.next_seq = index.next_seq.max(entry.seq + 1);
                        index.entries.insert(key, entry);
                    }
                    None => {
                        stale.push(path.with_extension(DATA_EXT));
                        stale.push(path);
                    }
                },
                _ => {}
            }
        }

        // Bodies without metadata
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(DATA_EXT)
                && fs::metadata(path.with_extension(META_EXT)).await.is_err()
            {
                stale.push(path);
            }
        }

        for path in stale {
            log::debug!("Removing stale cache file {}", path.display());
            if let Err(e) = remove_if_exists(&path).await {
                log::warn!("Failed to remove stale cache file {}: {}", path.display(), e);
            }
        }

        log::info!(
            "Opened disk image cache at {} with {} entries",
            dir.display(),
            index.entries.len()
        );

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    async fn load_entry(meta_path: &Path) -> Option<(String, IndexEntry)> {
        let raw = fs::read(meta_path).await.ok()?;
        let meta: EntryMeta = serde_json::from_slice(&raw).ok()?;
        let stem = meta_path.file_stem()?.to_str()?.to_string();
        if stem != file_stem(&meta.key) {
            return None;
        }

        let body = fs::metadata(meta_path.with_extension(DATA_EXT)).await.ok()?;
        if body.len() != meta.size {
            return None;
        }

        Some((
            meta.key,
            IndexEntry {
                stem,
                content_type: meta.content_type,
                cache_control: meta.cache_control,
                size: meta.size,
                seq: meta.seq,
            },
        ))
    }

    fn path(&self, stem: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", stem, ext))
    }

    fn forget(&self, key: &str, seq: u64) {
        let mut index = self.index.write();
        if index.entries.get(key).map(|entry| entry.seq) == Some(seq) {
            index.entries.remove(key);
        }
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<CachedImage>, CacheError> {
        let entry = self.index.read().entries.get(key).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let data = match fs::read(self.path(&entry.stem, DATA_EXT)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.forget(key, entry.seq);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        // A concurrent replacement may have swapped the body underneath us
        if data.len() as u64 != entry.size {
            log::debug!("Cache body for {} changed while reading, treating as miss", key);
            return Ok(None);
        }

        Ok(Some(CachedImage {
            data,
            content_type: entry.content_type,
            cache_control: entry.cache_control,
        }))
    }

    async fn put(&self, key: &str, entry: CachedImage) -> Result<(), CacheError> {
        let stem = file_stem(key);
        let seq = {
            let mut index = self.index.write();
            let seq = index.next_seq;
            index.next_seq += 1;
            seq
        };

        let meta = EntryMeta {
            key: key.to_string(),
            content_type: entry.content_type.clone(),
            cache_control: entry.cache_control.clone(),
            size: entry.size(),
            seq,
        };
        let meta_bytes = serde_json::to_vec(&meta)?;

        let data_tmp = self.path(&stem, &format!("{}.{}.{}", DATA_EXT, seq, TMP_EXT));
        let meta_tmp = self.path(&stem, &format!("{}.{}.{}", META_EXT, seq, TMP_EXT));
        write_atomically(&self.path(&stem, DATA_EXT), &data_tmp, &entry.data).await?;
        write_atomically(&self.path(&stem, META_EXT), &meta_tmp, &meta_bytes).await?;

        let mut index = self.index.write();
        let newer_exists = index.entries.get(key).map_or(false, |existing| existing.seq > seq);
        if !newer_exists {
            index.entries.insert(
                key.to_string(),
                IndexEntry {
                    stem,
                    content_type: meta.content_type,
                    cache_control: meta.cache_control,
                    size: meta.size,
                    seq,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self.index.write().entries.remove(key);
        match removed {
            Some(entry) => {
                remove_if_exists(&self.path(&entry.stem, META_EXT)).await?;
                remove_if_exists(&self.path(&entry.stem, DATA_EXT)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let index = self.index.read();
        let mut keys: Vec<(u64, &String)> = index.entries.iter().map(|(key, entry)| (entry.seq, key)).collect();
        keys.sort_unstable();
        Ok(keys.into_iter().map(|(_, key)| key.clone()).collect())
    }

    async fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.index.read().entries.values().map(|entry| entry.size).sum())
    }
}

/// Namespaces as subdirectories of a cache root.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn namespace_dir(&self, name: &str) -> Result<PathBuf, CacheError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(CacheError::InvalidNamespace(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    async fn is_owned(dir: &Path) -> bool {
        fs::metadata(dir.join(NAMESPACE_MARKER)).await.is_ok()
    }

    async fn is_empty_dir(dir: &Path) -> Result<bool, CacheError> {
        let mut read_dir = fs::read_dir(dir).await?;
        Ok(read_dir.next_entry().await?.is_none())
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheStore>, CacheError> {
        let dir = self.namespace_dir(name)?;
        fs::create_dir_all(&dir).await?;
        if !Self::is_owned(&dir).await {
            if !Self::is_empty_dir(&dir).await? {
                return Err(CacheError::InvalidNamespace(format!(
                    "{} exists and is not an image cache directory",
                    dir.display()
                )));
            }
            fs::write(dir.join(NAMESPACE_MARKER), name.as_bytes()).await?;
        }

        let store = DiskStore::open(dir).await?;
        Ok(Arc::new(store))
    }

    async fn names(&self) -> Result<Vec<String>, CacheError> {
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(item) = read_dir.next_entry().await? {
            if item.file_type().await?.is_dir() && Self::is_owned(&item.path()).await {
                if let Some(name) = item.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let dir = self.namespace_dir(name)?;
        if !Self::is_owned(&dir).await {
            return Ok(false);
        }
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
