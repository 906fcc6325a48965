//! On-disk key-value caches shared by every worker in a run.
//!
//! Each store is a [`DashMap`] so concurrent workers can read and write
//! independent keys without a global lock. Stores are loaded leniently at
//! the start of a run (a missing or corrupt file is an empty store) and
//! rewritten at the end through a temp file and rename, so a crash mid-write
//! never leaves a truncated cache behind.

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::models::{FeedCacheEntry, FullTextCacheEntry, ImageCacheEntry};

pub const FEED_CACHE_FILE: &str = "feed_cache.json";
pub const IMAGE_CACHE_FILE: &str = "image_cache.json";
pub const FULLTEXT_CACHE_FILE: &str = "fulltext_cache.json";

/// Cache values that carry their own write time (unix seconds).
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

impl Timestamped for FeedCacheEntry {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Timestamped for ImageCacheEntry {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Timestamped for FullTextCacheEntry {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// A concurrent string-keyed store.
#[derive(Debug)]
pub struct CacheStore<V> {
    name: &'static str,
    entries: DashMap<String, V>,
}

impl<V> CacheStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Timestamped,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
        }
    }

    /// Load a store, treating a missing or unreadable file as empty.
    pub async fn load(name: &'static str, path: &Path) -> Self {
        let store = Self::new(name);
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(cache = name, path = %path.display(), error = %e, "No cache file; starting empty");
                return store;
            }
        };
        match serde_json::from_slice::<HashMap<String, V>>(&bytes) {
            Ok(map) => {
                for (key, value) in map {
                    store.entries.insert(key, value);
                }
                info!(cache = name, entries = store.len(), "Loaded cache");
            }
            Err(e) => {
                warn!(cache = name, path = %path.display(), error = %e, "Corrupt cache file; starting empty");
            }
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries written before `cutoff` (unix seconds). Returns how many went.
    pub fn gc(&self, cutoff: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, value| value.timestamp() >= cutoff);
        before - self.entries.len()
    }

    /// Write the store as pretty JSON, atomically replacing `path`.
    ///
    /// Keys are written in sorted order so unchanged stores produce
    /// byte-identical files.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let snapshot: BTreeMap<String, V> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::io(path, e))?;
        debug!(cache = self.name, entries = snapshot.len(), path = %path.display(), "Persisted cache");
        Ok(())
    }
}

/// The three stores a run works against.
#[derive(Debug)]
pub struct Caches {
    pub feeds: CacheStore<FeedCacheEntry>,
    pub images: CacheStore<ImageCacheEntry>,
    pub fulltext: CacheStore<FullTextCacheEntry>,
}

impl Default for Caches {
    fn default() -> Self {
        Self {
            feeds: CacheStore::new("feeds"),
            images: CacheStore::new("images"),
            fulltext: CacheStore::new("fulltext"),
        }
    }
}

impl Caches {
    #[instrument(level = "info", skip_all, fields(dir = %dir.display()))]
    pub async fn load_from(dir: &Path) -> Caches {
        Caches {
            feeds: CacheStore::load("feeds", &dir.join(FEED_CACHE_FILE)).await,
            images: CacheStore::load("images", &dir.join(IMAGE_CACHE_FILE)).await,
            fulltext: CacheStore::load("fulltext", &dir.join(FULLTEXT_CACHE_FILE)).await,
        }
    }

    /// Garbage-collect entries older than `cutoff`, then write all stores.
    ///
    /// # Errors
    ///
    /// Any write failure is returned; it is terminal for the run.
    #[instrument(level = "info", skip_all, fields(dir = %dir.display()))]
    pub async fn persist_to(&self, dir: &Path, cutoff: i64) -> Result<()> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(dir, e))?;
        let removed =
            self.feeds.gc(cutoff) + self.images.gc(cutoff) + self.fulltext.gc(cutoff);
        self.feeds.persist(&dir.join(FEED_CACHE_FILE)).await?;
        self.images.persist(&dir.join(IMAGE_CACHE_FILE)).await?;
        self.fulltext.persist(&dir.join(FULLTEXT_CACHE_FILE)).await?;
        info!(
            feeds = self.feeds.len(),
            images = self.images.len(),
            fulltext = self.fulltext.len(),
            gc_removed = removed,
            "Persisted caches"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fulltext(content: &str, timestamp: i64) -> FullTextCacheEntry {
        FullTextCacheEntry {
            content: content.to_string(),
            hero_image: None,
            images: vec![],
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let caches = Caches::load_from(dir.path()).await;
        assert!(caches.feeds.is_empty());
        assert!(caches.images.is_empty());
        assert!(caches.fulltext.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FULLTEXT_CACHE_FILE), "{not json").unwrap();
        let caches = Caches::load_from(dir.path()).await;
        assert!(caches.fulltext.is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let caches = Caches::default();
        caches
            .fulltext
            .insert("https://a.com/1", fulltext("<p>one</p>", 1_000));
        caches.feeds.insert(
            "https://a.com/rss",
            FeedCacheEntry::new(b"<rss/>", Some("e1".into()), None, 1_000),
        );
        caches.persist_to(dir.path(), 0).await.unwrap();
        assert!(!dir.path().join("fulltext_cache.json.tmp").exists());

        let reloaded = Caches::load_from(dir.path()).await;
        assert_eq!(
            reloaded.fulltext.get("https://a.com/1").unwrap().content,
            "<p>one</p>"
        );
        let feed = reloaded.feeds.get("https://a.com/rss").unwrap();
        assert_eq!(feed.payload_bytes().unwrap(), b"<rss/>".to_vec());
    }

    #[tokio::test]
    async fn test_gc_drops_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let caches = Caches::default();
        caches.fulltext.insert("old", fulltext("x", 10));
        caches.fulltext.insert("new", fulltext("y", 500));
        caches.persist_to(dir.path(), 100).await.unwrap();

        let reloaded = Caches::load_from(dir.path()).await;
        assert!(reloaded.fulltext.get("old").is_none());
        assert!(reloaded.fulltext.get("new").is_some());
    }

    #[tokio::test]
    async fn test_persist_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store: CacheStore<FullTextCacheEntry> = CacheStore::new("fulltext");
        for i in 0..20 {
            store.insert(format!("k{i}"), fulltext("c", 1));
        }
        let path = dir.path().join("a.json");
        store.persist(&path).await.unwrap();
        let first = std::fs::read(&path).unwrap();
        store.persist(&path).await.unwrap();
        assert_eq!(first, std::fs::read(&path).unwrap());
    }
}
