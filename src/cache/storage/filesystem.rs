//! File System Tier
//!
//! Disk-backed cache with the memory tier's policy. Objects are written to a
//! temp file and renamed into place, so a reader either sees the complete
//! file or nothing. Each data file has a JSON sidecar used to rebuild the
//! index on startup.

use crate::cache::capacity::CapacityLedger;
use crate::cache::entry::{CacheEntry, LayerStats, ObjectId};
use crate::cache::lru::ShardedLruTracker;
use crate::cache::metrics::LayerCounters;
use crate::cache::sweeper::Expiring;
use crate::cache::tier::{CacheTier, MEDIUM_MAX_BYTES};
use crate::cache::{CacheLayer, ObjectStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATA_EXTENSION: &str = "glb";
const META_EXTENSION: &str = "meta";
const TMP_DIR: &str = ".tmp";

// =============================================================================
// File System Cache Configuration
// =============================================================================

/// Configuration for the file system tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemCacheConfig {
    pub enabled: bool,
    /// Root directory for cache files
    pub root_path: PathBuf,
    /// Maximum capacity in bytes
    pub capacity_bytes: u64,
    /// Objects larger than this are never placed here
    pub max_object_size: u64,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Whether to fsync data before it becomes visible
    pub sync_writes: bool,
    /// Read buffer used when streaming a file
    pub read_buffer_bytes: usize,
}

impl Default for FileSystemCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_path: PathBuf::from("/tmp/storage-cache"),
            capacity_bytes: 5 * 1024 * 1024 * 1024, // 5 GiB
            max_object_size: MEDIUM_MAX_BYTES,
            ttl_secs: 24 * 3600,
            sweep_interval_secs: 600,
            sync_writes: false,
            read_buffer_bytes: 256 * 1024,
        }
    }
}

impl FileSystemCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// =============================================================================
// Entry Metadata (stored alongside data)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMetadata {
    id: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct FileEntry {
    path: PathBuf,
    meta: CacheEntry,
}

// =============================================================================
// File System Cache
// =============================================================================

/// Bounded local-disk tier
pub struct FileSystemCache {
    root_path: PathBuf,
    tmp_path: PathBuf,
    index: DashMap<ObjectId, FileEntry>,
    lru: ShardedLruTracker,
    capacity: CapacityLedger,
    counters: LayerCounters,
    config: FileSystemCacheConfig,
}

impl FileSystemCache {
    /// Create a file cache rooted at `root_path` with default limits
    pub async fn with_path(root_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(FileSystemCacheConfig {
            root_path: root_path.into(),
            ..Default::default()
        })
        .await
    }

    /// Create a file cache with full config, rebuilding the index from disk
    pub async fn with_config(config: FileSystemCacheConfig) -> Result<Self> {
        let root_path = config.root_path.clone();
        let tmp_path = root_path.join(TMP_DIR);

        fs::create_dir_all(&root_path).await?;
        // Leftover temp files belong to writes that never completed
        if fs::metadata(&tmp_path).await.is_ok() {
            fs::remove_dir_all(&tmp_path).await?;
        }
        fs::create_dir_all(&tmp_path).await?;

        let cache = Self {
            root_path,
            tmp_path,
            index: DashMap::new(),
            lru: ShardedLruTracker::new(),
            capacity: CapacityLedger::new(config.capacity_bytes),
            counters: LayerCounters::new(),
            config,
        };
        cache.rebuild_index().await?;
        Ok(cache)
    }

    pub fn config(&self) -> &FileSystemCacheConfig {
        &self.config
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.max_bytes()
    }

    pub fn size_bytes(&self) -> u64 {
        self.capacity.used_bytes()
    }

    pub fn entry_count(&self) -> u64 {
        self.index.len() as u64
    }

    /// Metadata of a stored entry
    pub fn entry(&self, id: &ObjectId) -> Option<CacheEntry> {
        self.index.get(id).map(|e| e.meta.clone())
    }

    /// Sum of the sizes of live entries
    pub fn live_bytes(&self) -> u64 {
        self.index.iter().map(|e| e.meta.size_bytes).sum()
    }

    /// Get file path for an id
    fn data_path(&self, id: &ObjectId) -> PathBuf {
        // Hash-based subdirectories avoid too many files in one directory
        let shard_dir = self.root_path.join(format!("{:02x}", id.shard_index()));
        let filename = format!("{}.{}", urlencoding::encode(id.as_str()), DATA_EXTENSION);
        shard_dir.join(filename)
    }

    /// Rebuild the index from sidecar metadata, newest entries first
    async fn rebuild_index(&self) -> Result<()> {
        let mut found: Vec<(ObjectId, PathBuf, StoredMetadata)> = Vec::new();
        let mut orphans: Vec<PathBuf> = Vec::new();

        let mut root_entries = fs::read_dir(&self.root_path).await?;
        while let Some(root_entry) = root_entries.next_entry().await? {
            let shard_path = root_entry.path();
            if shard_path == self.tmp_path || !root_entry.file_type().await?.is_dir() {
                continue;
            }

            let mut shard_entries = match fs::read_dir(&shard_path).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = shard_entries.next_entry().await? {
                let path = entry.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(META_EXTENSION) => match read_sidecar(&path).await {
                        Some((meta, data_path)) => {
                            found.push((ObjectId::new(meta.id.clone()), data_path, meta))
                        }
                        None => orphans.push(path),
                    },
                    Some(DATA_EXTENSION) => {
                        if fs::metadata(path.with_extension(META_EXTENSION)).await.is_err() {
                            orphans.push(path);
                        }
                    }
                    _ => {}
                }
            }
        }

        found.sort_by(|a, b| b.2.created_at.cmp(&a.2.created_at));
        let mut kept = Vec::new();
        for (id, path, meta) in found {
            if self.capacity.try_reserve(meta.size_bytes) {
                kept.push((id, path, meta));
            } else {
                orphans.push(path.with_extension(META_EXTENSION));
                orphans.push(path);
            }
        }

        // Oldest first so recency order matches creation order
        for (id, path, meta) in kept.into_iter().rev() {
            self.lru.track(&id, meta.size_bytes);
            self.index.insert(
                id,
                FileEntry {
                    path,
                    meta: CacheEntry::created_at(meta.size_bytes, meta.created_at),
                },
            );
        }

        for path in orphans {
            remove_file_quietly(&path).await;
        }

        if !self.index.is_empty() {
            info!(
                entries = self.index.len(),
                bytes = self.capacity.used_bytes(),
                root = %self.root_path.display(),
                "File cache index rebuilt"
            );
        }
        Ok(())
    }

    /// Make room for `size` bytes; returns files of evicted entries to unlink
    fn reserve(&self, size: u64) -> Result<Vec<PathBuf>> {
        let mut victims = Vec::new();
        while !self.capacity.try_reserve(size) {
            match self.evict_one() {
                Some(path) => victims.push(path),
                None => {
                    return Err(Error::CapacityExceeded {
                        tier: CacheTier::FileSystem,
                        requested: size,
                        capacity: self.capacity.max_bytes(),
                    });
                }
            }
        }
        Ok(victims)
    }

    fn evict_one(&self) -> Option<PathBuf> {
        while let Some(victim) = self.lru.pop_lru() {
            if let Some((_, entry)) = self.index.remove(&victim.id) {
                self.capacity.release(entry.meta.size_bytes);
                self.counters.record_eviction();
                debug!(id = %victim.id, size = entry.meta.size_bytes, "Evicted from file tier");
                return Some(entry.path);
            }
        }
        None
    }

    /// Drop an index entry; the caller decides whether to unlink its files
    fn remove_index_entry(&self, id: &ObjectId) -> Option<FileEntry> {
        let (_, entry) = self.index.remove(id)?;
        self.lru.remove(id);
        self.capacity.release(entry.meta.size_bytes);
        Some(entry)
    }

    /// The file vanished underneath the index (raced with an eviction)
    fn forget_stale(&self, id: &ObjectId, path: &Path) {
        if let Some((_, entry)) = self.index.remove_if(id, |_, e| e.path == path) {
            self.lru.remove(id);
            self.capacity.release(entry.meta.size_bytes);
        }
    }

    /// Resolve an id to its file, recording the access
    fn locate(&self, id: &ObjectId) -> Option<PathBuf> {
        let path = self.index.get_mut(id).map(|mut entry| {
            entry.meta.record_access();
            entry.path.clone()
        });
        if path.is_some() {
            self.lru.access(id);
        }
        path
    }

    async fn write_atomically(&self, id: &ObjectId, data: &Bytes, final_path: &Path) -> std::io::Result<()> {
        let tmp_data = self.tmp_path.join(Uuid::new_v4().to_string());
        let tmp_meta = tmp_data.with_extension(META_EXTENSION);

        let result = async {
            let mut file = fs::File::create(&tmp_data).await?;
            file.write_all(data).await?;
            if self.config.sync_writes {
                file.sync_all().await?;
            }
            drop(file);

            let meta = StoredMetadata {
                id: id.to_string(),
                size_bytes: data.len() as u64,
                created_at: Utc::now(),
            };
            fs::write(&tmp_meta, serde_json::to_vec(&meta)?).await?;

            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&tmp_data, final_path).await?;
            fs::rename(&tmp_meta, final_path.with_extension(META_EXTENSION)).await
        }
        .await;

        if result.is_err() {
            remove_file_quietly(&tmp_data).await;
            remove_file_quietly(&tmp_meta).await;
        }
        result
    }

    async fn unlink(path: &Path) {
        remove_file_quietly(path).await;
        remove_file_quietly(&path.with_extension(META_EXTENSION)).await;
    }

    fn io_failure(&self, err: impl std::fmt::Display) -> Error {
        self.counters.record_error();
        Error::unavailable(CacheTier::FileSystem, err)
    }
}

async fn read_sidecar(meta_path: &Path) -> Option<(StoredMetadata, PathBuf)> {
    let raw = fs::read(meta_path).await.ok()?;
    let meta: StoredMetadata = serde_json::from_slice(&raw).ok()?;
    let data_path = meta_path.with_extension(DATA_EXTENSION);
    let on_disk = fs::metadata(&data_path).await.ok()?;
    (on_disk.len() == meta.size_bytes).then_some((meta, data_path))
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
        }
    }
}

#[async_trait]
impl CacheLayer for FileSystemCache {
    fn tier(&self) -> CacheTier {
        CacheTier::FileSystem
    }

    fn max_object_size(&self) -> u64 {
        self.config.max_object_size
    }

    async fn store(&self, id: &ObjectId, data: Bytes) -> Result<()> {
        let start = Instant::now();
        let size = data.len() as u64;

        if !self.capacity.can_ever_fit(size) {
            return Err(Error::CapacityExceeded {
                tier: CacheTier::FileSystem,
                requested: size,
                capacity: self.capacity.max_bytes(),
            });
        }

        // The rename below replaces the old file, so only the index entry goes.
        // If the write never lands, the old files leave with it.
        let previous = self.remove_index_entry(id);
        let victims = match self.reserve(size) {
            Ok(victims) => victims,
            Err(e) => {
                if let Some(old) = previous {
                    Self::unlink(&old.path).await;
                }
                return Err(e);
            }
        };
        for path in victims {
            Self::unlink(&path).await;
        }

        let path = self.data_path(id);
        if let Err(e) = self.write_atomically(id, &data, &path).await {
            self.capacity.release(size);
            if let Some(old) = previous {
                Self::unlink(&old.path).await;
            }
            return Err(self.io_failure(e));
        }

        let entry = FileEntry {
            path,
            meta: CacheEntry::new(size),
        };
        if let Some(replaced) = self.index.insert(id.clone(), entry) {
            self.capacity.release(replaced.meta.size_bytes);
        }
        self.lru.track(id, size);
        self.counters.record_latency(start.elapsed());
        Ok(())
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        let start = Instant::now();
        let Some(path) = self.locate(id) else {
            self.counters.record_miss();
            return Ok(None);
        };

        match fs::read(&path).await {
            Ok(data) => {
                self.counters.record_hit();
                self.counters.record_latency(start.elapsed());
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.forget_stale(id, &path);
                self.counters.record_miss();
                Ok(None)
            }
            Err(e) => Err(self.io_failure(e)),
        }
    }

    async fn get_stream(&self, id: &ObjectId) -> Result<Option<ObjectStream>> {
        let start = Instant::now();
        let Some(path) = self.locate(id) else {
            self.counters.record_miss();
            return Ok(None);
        };

        // Once open, the handle keeps the bytes readable even if the file is unlinked
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.forget_stale(id, &path);
                self.counters.record_miss();
                return Ok(None);
            }
            Err(e) => return Err(self.io_failure(e)),
        };
        let size = file.metadata().await.map_err(|e| self.io_failure(e))?.len();

        self.counters.record_hit();
        self.counters.record_latency(start.elapsed());
        let body = ReaderStream::with_capacity(file, self.config.read_buffer_bytes).boxed();
        Ok(Some(ObjectStream::new(size, body)))
    }

    async fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.index.contains_key(id))
    }

    async fn delete(&self, id: &ObjectId) -> Result<()> {
        if let Some(entry) = self.remove_index_entry(id) {
            Self::unlink(&entry.path).await;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let paths: Vec<PathBuf> = self.index.iter().map(|e| e.path.clone()).collect();
        self.index.clear();
        self.lru.clear();
        self.capacity.reset();
        self.counters.reset();
        for path in paths {
            Self::unlink(&path).await;
        }
        Ok(())
    }

    async fn stats(&self) -> LayerStats {
        self.counters.layer_stats(
            CacheTier::FileSystem,
            self.entry_count(),
            self.size_bytes(),
            Some(self.capacity_bytes()),
        )
    }

    async fn health_check(&self) -> Result<bool> {
        match fs::metadata(&self.root_path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) => Err(Error::unavailable(CacheTier::FileSystem, e)),
        }
    }
}

#[async_trait]
impl Expiring for FileSystemCache {
    fn sweep_label(&self) -> &'static str {
        "FILESYSTEM"
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl();
        let expired: Vec<ObjectId> = self
            .index
            .iter()
            .filter(|e| e.meta.is_expired_at(ttl, now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, entry)) = self
                .index
                .remove_if(&id, |_, e| e.meta.is_expired_at(ttl, now))
            {
                self.lru.remove(&id);
                self.capacity.release(entry.meta.size_bytes);
                self.counters.record_expiration();
                Self::unlink(&entry.path).await;
                removed += 1;
            }
        }
        removed
    }
}

// =============================================================================
// Tests
// =============================================================================
