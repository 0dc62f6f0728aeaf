//! Content-addressed audio cache.
//!
//! Files live in one directory as `cache_<fingerprint>.<ext>`. Writers stage
//! audio in a temp file and publish it with a no-clobber hard link, so a
//! canonical file is always complete and the first writer wins. The in-memory
//! index tracks recency and sizes for LRU eviction and is rebuilt from the
//! directory on open.
//!
//! Entries held by a [`CacheLease`] are skipped by eviction until the lease
//! is dropped, so a batch can keep its segments around until it has merged
//! them even when the batch alone exceeds the budget.

use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use audio_core::AudioFormat;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{error::CacheError, request::Fingerprint};

const FILE_PREFIX: &str = "cache_";
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheBudget {
    pub max_bytes: u64,
    pub max_entries: usize,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_bytes: 1000 * 1024 * 1024,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub file_path: PathBuf,
    pub format: AudioFormat,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub max_entries: usize,
    pub root: PathBuf,
}

struct CacheIndex {
    entries: LruCache<Fingerprint, CacheEntry>,
    total_bytes: u64,
}

impl CacheIndex {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
        }
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_bytes += entry.size_bytes;
        if let Some(old) = self.entries.put(entry.fingerprint.clone(), entry) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.entries.pop(fingerprint)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, entry) = self.entries.pop_lru()?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn over_budget(&self, budget: &CacheBudget) -> bool {
        self.total_bytes > budget.max_bytes || self.entries.len() > budget.max_entries
    }
}

/// Pin counts per fingerprint. Several batches may pin the same entry.
#[derive(Default)]
struct Pins {
    counts: StdMutex<HashMap<Fingerprint, usize>>,
}

impl Pins {
    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, usize>> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, fingerprints: &[Fingerprint]) {
        let mut counts = self.counts();
        for fingerprint in fingerprints {
            *counts.entry(fingerprint.clone()).or_insert(0) += 1;
        }
    }

    fn release(&self, fingerprints: &[Fingerprint]) {
        let mut counts = self.counts();
        for fingerprint in fingerprints {
            if let Some(count) = counts.get_mut(fingerprint) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(fingerprint);
                }
            }
        }
    }

    fn snapshot(&self) -> HashSet<Fingerprint> {
        self.counts().keys().cloned().collect()
    }
}

/// Keeps a set of fingerprints out of eviction while alive.
pub struct CacheLease {
    pins: Arc<Pins>,
    fingerprints: Vec<Fingerprint>,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.pins.release(&self.fingerprints);
    }
}

pub struct CacheStore {
    root: PathBuf,
    budget: CacheBudget,
    index: Mutex<CacheIndex>,
    pins: Arc<Pins>,
}

fn parse_file_name(name: &str) -> Option<(Fingerprint, AudioFormat)> {
    let (stem, ext) = name.strip_prefix(FILE_PREFIX)?.rsplit_once('.')?;
    let format: AudioFormat = ext.parse().ok()?;
    // Only the canonical lower-case extension counts
    if ext != format.extension() {
        return None;
    }
    Some((Fingerprint::parse(stem)?, format))
}

async fn is_usable_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

async fn delete_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete cache file");
            false
        }
    }
}

impl CacheStore {
    /// Create the cache directory if needed and rebuild the index from the
    /// files already in it. Leftover temp files are removed.
    pub async fn open(root: impl Into<PathBuf>, budget: CacheBudget) -> Result<Self, CacheError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| CacheError::io(&root, e))?;

        let mut found = Vec::new();
        let mut stale_temps = 0usize;
        let mut dir = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| CacheError::io(&root, e))?;
        while let Some(dirent) = dir.next_entry().await.map_err(|e| CacheError::io(&root, e))? {
            let path = dirent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                if delete_file(&path).await {
                    stale_temps += 1;
                }
                continue;
            }
            let Some((fingerprint, format)) = parse_file_name(name) else {
                continue;
            };
            let metadata = match dirent.metadata().await {
                Ok(m) if m.is_file() && m.len() > 0 => m,
                _ => continue,
            };
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            found.push(CacheEntry {
                fingerprint,
                file_path: path,
                format,
                created_at: modified,
                last_accessed_at: modified,
                size_bytes: metadata.len(),
            });
        }

        // Oldest first so they sit at the LRU end
        found.sort_by_key(|e| e.last_accessed_at);
        let mut index = CacheIndex::new();
        for entry in found {
            index.insert(entry);
        }

        let store = Self {
            root,
            budget,
            index: Mutex::new(index),
            pins: Arc::new(Pins::default()),
        };
        let evicted = store.evict_if_over_budget().await;
        let stats = store.stats().await;
        info!(
            root = %store.root.display(),
            entries = stats.entries,
            total_bytes = stats.total_bytes,
            evicted,
            stale_temps,
            "Cache opened"
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn budget(&self) -> CacheBudget {
        self.budget
    }

    fn canonical_path(&self, fingerprint: &Fingerprint, format: AudioFormat) -> PathBuf {
        self.root
            .join(format!("{FILE_PREFIX}{fingerprint}.{}", format.extension()))
    }

    fn temp_path(&self, format: AudioFormat) -> PathBuf {
        self.root.join(format!(
            "{TEMP_PREFIX}{}.{}",
            uuid::Uuid::new_v4().simple(),
            format.extension()
        ))
    }

    /// Pin `fingerprints` against eviction until the returned lease is
    /// dropped. Fingerprints need not be cached yet. While pins are held the
    /// cache may sit above its budget; the next `put` or
    /// `evict_if_over_budget` after release brings it back.
    pub fn lease(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) -> CacheLease {
        let fingerprints: Vec<Fingerprint> = fingerprints.into_iter().collect();
        self.pins.acquire(&fingerprints);
        CacheLease {
            pins: Arc::clone(&self.pins),
            fingerprints,
        }
    }

    /// Path of the cached audio, touching its recency. An entry whose file
    /// has vanished is dropped and reported as a miss.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let mut index = self.index.lock().await;
        let entry = index.entries.get_mut(fingerprint)?;
        if is_usable_file(&entry.file_path).await {
            entry.last_accessed_at = Utc::now();
            return Some(entry.file_path.clone());
        }

        if let Some(entry) = index.remove(fingerprint) {
            warn!(fingerprint = %fingerprint, path = %entry.file_path.display(), "cached file vanished, dropping entry");
        }
        None
    }

    /// Store audio bytes under `fingerprint` and return the canonical path.
    pub async fn put(
        &self,
        fingerprint: &Fingerprint,
        format: AudioFormat,
        audio: &[u8],
    ) -> Result<PathBuf, CacheError> {
        let temp = self.temp_path(format);
        if let Err(e) = tokio::fs::write(&temp, audio).await {
            delete_file(&temp).await;
            return Err(CacheError::io(&temp, e));
        }
        self.publish(fingerprint, format, &temp).await
    }

    /// Store a copy of an existing audio file under `fingerprint`.
    pub async fn put_file(
        &self,
        fingerprint: &Fingerprint,
        format: AudioFormat,
        source: &Path,
    ) -> Result<PathBuf, CacheError> {
        let temp = self.temp_path(format);
        if let Err(e) = tokio::fs::copy(source, &temp).await {
            delete_file(&temp).await;
            return Err(CacheError::io(source, e));
        }
        self.publish(fingerprint, format, &temp).await
    }

    async fn publish(
        &self,
        fingerprint: &Fingerprint,
        format: AudioFormat,
        temp: &Path,
    ) -> Result<PathBuf, CacheError> {
        let canonical = self.canonical_path(fingerprint, format);
        let linked = tokio::fs::hard_link(temp, &canonical).await;
        delete_file(temp).await;
        match linked {
            Ok(()) => debug!(fingerprint = %fingerprint, "cache entry published"),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(fingerprint = %fingerprint, "cache entry already published by another writer")
            }
            Err(e) => return Err(CacheError::io(&canonical, e)),
        }

        let size_bytes = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| CacheError::io(&canonical, e))?
            .len();
        let now = Utc::now();

        let mut index = self.index.lock().await;
        match index.entries.get_mut(fingerprint) {
            Some(existing) => existing.last_accessed_at = now,
            None => index.insert(CacheEntry {
                fingerprint: fingerprint.clone(),
                file_path: canonical.clone(),
                format,
                created_at: now,
                last_accessed_at: now,
                size_bytes,
            }),
        }
        let evicted = self.evict_locked(&mut index, Some(fingerprint)).await;
        if evicted > 0 {
            debug!(evicted, "cache evicted entries after put");
        }
        Ok(canonical)
    }

    async fn evict_locked(&self, index: &mut CacheIndex, keep: Option<&Fingerprint>) -> usize {
        if !index.over_budget(&self.budget) {
            return 0;
        }
        let pinned = self.pins.snapshot();

        // Least recently used first, skipping the entry just written and
        // anything leased
        let mut total_bytes = index.total_bytes;
        let mut count = index.entries.len();
        let mut victims = Vec::new();
        for (fingerprint, entry) in index.entries.iter().rev() {
            if total_bytes <= self.budget.max_bytes && count <= self.budget.max_entries {
                break;
            }
            if Some(fingerprint) == keep || pinned.contains(fingerprint) {
                continue;
            }
            total_bytes = total_bytes.saturating_sub(entry.size_bytes);
            count -= 1;
            victims.push(fingerprint.clone());
        }

        let mut evicted = 0;
        for fingerprint in victims {
            let Some(entry) = index.remove(&fingerprint) else {
                continue;
            };
            delete_file(&entry.file_path).await;
            debug!(fingerprint = %entry.fingerprint, size = entry.size_bytes, "evicted cache entry");
            evicted += 1;
        }
        if index.over_budget(&self.budget) {
            debug!(
                entries = index.entries.len(),
                total_bytes = index.total_bytes,
                pinned = pinned.len(),
                "cache over budget, remaining entries are pinned"
            );
        }
        evicted
    }

    /// Remove least-recently-used entries until the cache fits its budget.
    pub async fn evict_if_over_budget(&self) -> usize {
        let mut index = self.index.lock().await;
        self.evict_locked(&mut index, None).await
    }

    /// Drop every entry and its file. Returns the number of files removed.
    pub async fn clear(&self) -> usize {
        let mut index = self.index.lock().await;
        let mut removed = 0;
        while let Some(entry) = index.pop_lru() {
            if delete_file(&entry.file_path).await {
                removed += 1;
            }
        }
        index.total_bytes = 0;
        info!(removed, "Cache cleared");
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            max_bytes: self.budget.max_bytes,
            max_entries: self.budget.max_entries,
            root: self.root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::parse(&format!("{:064x}", n)).unwrap()
    }

    #[test]
    fn test_parse_file_name() {
        let name = format!("cache_{}.mp3", fp(7));
        assert_eq!(parse_file_name(&name), Some((fp(7), AudioFormat::Mp3)));
        assert!(parse_file_name("cache_nothex.mp3").is_none());
        assert!(parse_file_name(&format!("cache_{}.ogg", fp(7))).is_none());
        assert!(parse_file_name(&format!("cache_{}.MP3", fp(7))).is_none());
        assert!(parse_file_name("batch_1234.mp3").is_none());
    }

    #[tokio::test]
    async fn test_put_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path(), CacheBudget::default()).await.unwrap();

        assert!(cache.lookup(&fp(1)).await.is_none());
        let path = cache.put(&fp(1), AudioFormat::Wav, b"RIFF....").await.unwrap();
        assert_eq!(cache.lookup(&fp(1)).await, Some(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFF....");
        assert_eq!(cache.stats().await.total_bytes, 8);
    }

    #[tokio::test]
    async fn test_second_writer_yields() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path(), CacheBudget::default()).await.unwrap();

        let first = cache.put(&fp(2), AudioFormat::Mp3, b"first").await.unwrap();
        let second = cache.put(&fp(2), AudioFormat::Mp3, b"second").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(cache.stats().await.entries, 1);
        // No temp files left behind
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_put_file_copies_into_root() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path().join("cache"), CacheBudget::default()).await.unwrap();
        let source = dir.path().join("segment.mp3");
        std::fs::write(&source, b"ID3 audio").unwrap();

        let path = cache.put_file(&fp(4), AudioFormat::Mp3, &source).await.unwrap();

        assert!(path.starts_with(cache.root()));
        assert!(source.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"ID3 audio");
        assert_eq!(cache.budget(), CacheBudget::default());
        assert!(cache.put_file(&fp(5), AudioFormat::Mp3, &dir.path().join("missing.mp3")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_writers_of_one_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path(), CacheBudget::default()).await.unwrap();
        let key = fp(9);
        let payloads: Vec<Vec<u8>> = (0..8).map(|i| format!("writer {i} audio").into_bytes()).collect();

        let paths = futures::future::join_all(
            payloads
                .iter()
                .map(|bytes| cache.put(&key, AudioFormat::Mp3, bytes)),
        )
        .await;

        let paths: Vec<PathBuf> = paths.into_iter().map(|p| p.unwrap()).collect();
        assert!(paths.iter().all(|p| p == &paths[0]));
        assert_eq!(cache.stats().await.entries, 1);
        let content = std::fs::read(&paths[0]).unwrap();
        assert!(payloads.contains(&content));
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_leased_entries_survive_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let budget = CacheBudget { max_bytes: u64::MAX, max_entries: 2 };
        let cache = CacheStore::open(dir.path(), budget).await.unwrap();

        let lease = cache.lease([fp(1), fp(2), fp(3), fp(4)]);
        let mut paths = Vec::new();
        for n in 1..=4 {
            paths.push(cache.put(&fp(n), AudioFormat::Wav, b"segment").await.unwrap());
        }
        assert!(paths.iter().all(|p| p.exists()));
        assert_eq!(cache.stats().await.entries, 4);

        drop(lease);
        assert_eq!(cache.evict_if_over_budget().await, 2);
        assert_eq!(cache.stats().await.entries, 2);
        // Oldest two go first
        assert!(!paths[0].exists() && !paths[1].exists());
        assert!(paths[2].exists() && paths[3].exists());
    }

    #[tokio::test]
    async fn test_overlapping_leases_keep_pin_until_last_release() {
        let dir = tempfile::tempdir().unwrap();
        let budget = CacheBudget { max_bytes: u64::MAX, max_entries: 1 };
        let cache = CacheStore::open(dir.path(), budget).await.unwrap();

        let first = cache.lease([fp(1)]);
        let second = cache.lease([fp(1)]);
        let pinned = cache.put(&fp(1), AudioFormat::Mp3, b"one").await.unwrap();
        drop(first);
        cache.put(&fp(2), AudioFormat::Mp3, b"two").await.unwrap();
        assert!(pinned.exists());

        drop(second);
        cache.put(&fp(3), AudioFormat::Mp3, b"three").await.unwrap();
        assert!(!pinned.exists());
    }

    #[tokio::test]
    async fn test_vanished_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path(), CacheBudget::default()).await.unwrap();
        let path = cache.put(&fp(3), AudioFormat::Mp3, b"data").await.unwrap();

        std::fs::remove_file(&path).unwrap();

        assert!(cache.lookup(&fp(3)).await.is_none());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_by_count() {
        let dir = tempfile::tempdir().unwrap();
        let budget = CacheBudget { max_bytes: u64::MAX, max_entries: 2 };
        let cache = CacheStore::open(dir.path(), budget).await.unwrap();

        let first = cache.put(&fp(1), AudioFormat::Mp3, b"one").await.unwrap();
        cache.put(&fp(2), AudioFormat::Mp3, b"two").await.unwrap();
        // Touch 1 so 2 becomes least recently used
        assert!(cache.lookup(&fp(1)).await.is_some());
        cache.put(&fp(3), AudioFormat::Mp3, b"three").await.unwrap();

        assert!(cache.lookup(&fp(2)).await.is_none());
        assert!(cache.lookup(&fp(1)).await.is_some());
        assert!(cache.lookup(&fp(3)).await.is_some());
        assert!(first.exists());
    }

    #[tokio::test]
    async fn test_eviction_by_bytes_keeps_new_entry() {
        let dir = tempfile::tempdir().unwrap();
        let budget = CacheBudget { max_bytes: 4, max_entries: 100 };
        let cache = CacheStore::open(dir.path(), budget).await.unwrap();

        cache.put(&fp(1), AudioFormat::Mp3, b"abc").await.unwrap();
        // Alone over budget, still kept
        let big = cache.put(&fp(2), AudioFormat::Mp3, b"0123456789").await.unwrap();

        assert!(big.exists());
        assert!(cache.lookup(&fp(1)).await.is_none());
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index_and_cleans_temps() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheStore::open(dir.path(), CacheBudget::default()).await.unwrap();
            cache.put(&fp(5), AudioFormat::Wav, b"wavdata").await.unwrap();
        }
        std::fs::write(dir.path().join(".tmp-crashed.mp3"), b"partial").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let cache = CacheStore::open(dir.path(), CacheBudget::default()).await.unwrap();

        assert!(cache.lookup(&fp(5)).await.is_some());
        assert_eq!(cache.stats().await.entries, 1);
        assert!(!dir.path().join(".tmp-crashed.mp3").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_clear_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path(), CacheBudget::default()).await.unwrap();
        let a = cache.put(&fp(1), AudioFormat::Mp3, b"a").await.unwrap();
        let b = cache.put(&fp(2), AudioFormat::Wav, b"b").await.unwrap();

        assert_eq!(cache.clear().await, 2);
        assert!(!a.exists() && !b.exists());
        let stats = cache.stats().await;
        assert_eq!((stats.entries, stats.total_bytes), (0, 0));
    }
}
