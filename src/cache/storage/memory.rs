//! Memory Tier
//!
//! In-process cache using DashMap for concurrent access, evicting by LRU
//! under capacity pressure and expiring entries by age.

use crate::cache::capacity::CapacityLedger;
use crate::cache::entry::{CacheEntry, LayerStats, ObjectId};
use crate::cache::lru::ShardedLruTracker;
use crate::cache::metrics::LayerCounters;
use crate::cache::sweeper::Expiring;
use crate::cache::tier::{CacheTier, MEDIUM_SMALL_MAX_BYTES};
use crate::cache::{CacheLayer, ObjectStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

// =============================================================================
// Memory Cache Configuration
// =============================================================================

/// Configuration for the memory tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub enabled: bool,
    /// Maximum capacity in bytes
    pub capacity_bytes: u64,
    /// Objects larger than this are never placed here
    pub max_object_size: u64,
    /// Entry lifetime measured from creation
    pub ttl_secs: u64,
    /// How often the TTL sweep runs
    pub sweep_interval_secs: u64,
    /// Slice size used when serving an entry as a stream
    pub stream_chunk_bytes: usize,
    /// Number of shards for DashMap (0 = auto)
    pub shard_count: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_object_size: MEDIUM_SMALL_MAX_BYTES,
            ttl_secs: 3600,
            sweep_interval_secs: 300,
            stream_chunk_bytes: 256 * 1024,
            shard_count: 0,
        }
    }
}

impl MemoryCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// =============================================================================
// Memory Cache
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: Bytes,
    meta: CacheEntry,
}

/// Bounded in-memory tier
pub struct MemoryCache {
    /// Bytes and metadata live in one map so they can never disagree
    entries: DashMap<ObjectId, MemoryEntry>,
    lru: ShardedLruTracker,
    capacity: CapacityLedger,
    counters: LayerCounters,
    config: MemoryCacheConfig,
}

impl MemoryCache {
    /// Create new memory cache with default config
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    /// Create new memory cache with specified capacity
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self::with_config(MemoryCacheConfig {
            capacity_bytes,
            ..Default::default()
        })
    }

    /// Create new memory cache with full config
    pub fn with_config(config: MemoryCacheConfig) -> Self {
        let entries = if config.shard_count > 0 {
            DashMap::with_shard_amount(config.shard_count)
        } else {
            DashMap::new()
        };

        Self {
            entries,
            lru: ShardedLruTracker::new(),
            capacity: CapacityLedger::new(config.capacity_bytes),
            counters: LayerCounters::new(),
            config,
        }
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Get current capacity
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity.max_bytes()
    }

    /// Bytes accounted to stored entries
    pub fn size_bytes(&self) -> u64 {
        self.capacity.used_bytes()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Metadata of a stored entry
    pub fn entry(&self, id: &ObjectId) -> Option<CacheEntry> {
        self.entries.get(id).map(|e| e.meta.clone())
    }

    /// Sum of the sizes of live entries
    pub fn live_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.meta.size_bytes).sum()
    }

    /// Make room for `size` bytes, evicting least recently used entries
    fn reserve(&self, size: u64) -> Result<()> {
        while !self.capacity.try_reserve(size) {
            if !self.evict_one() {
                return Err(Error::CapacityExceeded {
                    tier: CacheTier::Memory,
                    requested: size,
                    capacity: self.capacity.max_bytes(),
                });
            }
        }
        Ok(())
    }

    fn evict_one(&self) -> bool {
        while let Some(victim) = self.lru.pop_lru() {
            // A victim already gone from the map was deleted concurrently
            if let Some((_, entry)) = self.entries.remove(&victim.id) {
                self.capacity.release(entry.meta.size_bytes);
                self.counters.record_eviction();
                debug!(id = %victim.id, size = entry.meta.size_bytes, "Evicted from memory tier");
                return true;
            }
        }
        false
    }

    fn remove_entry(&self, id: &ObjectId) -> Option<u64> {
        let (_, entry) = self.entries.remove(id)?;
        self.lru.remove(id);
        self.capacity.release(entry.meta.size_bytes);
        Some(entry.meta.size_bytes)
    }

    fn lookup(&self, id: &ObjectId) -> Option<Bytes> {
        let data = self.entries.get_mut(id).map(|mut entry| {
            entry.meta.record_access();
            entry.data.clone()
        });
        match data {
            Some(data) => {
                self.lru.access(id);
                self.counters.record_hit();
                Some(data)
            }
            None => {
                self.counters.record_miss();
                None
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for MemoryCache {
    fn tier(&self) -> CacheTier {
        CacheTier::Memory
    }

    fn max_object_size(&self) -> u64 {
        self.config.max_object_size
    }

    async fn store(&self, id: &ObjectId, data: Bytes) -> Result<()> {
        let start = Instant::now();
        let size = data.len() as u64;

        // Fail fast instead of evicting everything for an object that cannot fit
        if !self.capacity.can_ever_fit(size) {
            return Err(Error::CapacityExceeded {
                tier: CacheTier::Memory,
                requested: size,
                capacity: self.capacity.max_bytes(),
            });
        }

        self.remove_entry(id);
        self.reserve(size)?;

        let entry = MemoryEntry {
            data,
            meta: CacheEntry::new(size),
        };
        if let Some(replaced) = self.entries.insert(id.clone(), entry) {
            // A concurrent store of the same id won the race; its bytes are gone now
            self.capacity.release(replaced.meta.size_bytes);
        }
        self.lru.track(id, size);
        self.counters.record_latency(start.elapsed());
        Ok(())
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        let start = Instant::now();
        let data = self.lookup(id);
        self.counters.record_latency(start.elapsed());
        Ok(data)
    }

    async fn get_stream(&self, id: &ObjectId) -> Result<Option<ObjectStream>> {
        let start = Instant::now();
        let stream = self
            .lookup(id)
            .map(|data| ObjectStream::from_bytes(data, self.config.stream_chunk_bytes));
        self.counters.record_latency(start.elapsed());
        Ok(stream)
    }

    async fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.entries.contains_key(id))
    }

    async fn delete(&self, id: &ObjectId) -> Result<()> {
        self.remove_entry(id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        self.lru.clear();
        self.capacity.reset();
        self.counters.reset();
        Ok(())
    }

    async fn stats(&self) -> LayerStats {
        self.counters.layer_stats(
            CacheTier::Memory,
            self.entry_count(),
            self.size_bytes(),
            Some(self.capacity_bytes()),
        )
    }
}

#[async_trait]
impl Expiring for MemoryCache {
    fn sweep_label(&self) -> &'static str {
        "MEMORY"
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl();
        let expired: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|e| e.meta.is_expired_at(ttl, now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            // Re-check under the shard lock: the id may have been re-stored since the scan
            if let Some((_, entry)) = self
                .entries
                .remove_if(&id, |_, e| e.meta.is_expired_at(ttl, now))
            {
                self.lru.remove(&id);
                self.capacity.release(entry.meta.size_bytes);
                self.counters.record_expiration();
                removed += 1;
            }
        }
        removed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    fn bytes(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let cache = MemoryCache::new();

        cache.store(&id("file1"), Bytes::from("hello world")).await.unwrap();
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.size_bytes(), 11);

        let data = cache.get(&id("file1")).await.unwrap().unwrap();
        assert_eq!(data, Bytes::from("hello world"));

        assert!(cache.exists(&id("file1")).await.unwrap());
        assert!(!cache.exists(&id("nonexistent")).await.unwrap());

        cache.delete(&id("file1")).await.unwrap();
        cache.delete(&id("file1")).await.unwrap();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_update_existing() {
        let cache = MemoryCache::new();

        cache.store(&id("file1"), Bytes::from("short")).await.unwrap();
        cache
            .store(&id("file1"), Bytes::from("much longer data here"))
            .await
            .unwrap();

        assert_eq!(cache.size_bytes(), 21);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.live_bytes(), 21);
    }

    #[tokio::test]
    async fn test_counters_and_access_metadata() {
        let cache = MemoryCache::new();
        cache.store(&id("a"), Bytes::from("abc")).await.unwrap();

        cache.get(&id("a")).await.unwrap();
        cache.get(&id("a")).await.unwrap();
        cache.get(&id("missing")).await.unwrap();
        // exists has no counter side effects
        cache.exists(&id("a")).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(cache.entry(&id("a")).unwrap().access_count, 2);
    }

    #[tokio::test]
    async fn test_stream_returns_identical_bytes() {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            stream_chunk_bytes: 7,
            ..Default::default()
        });
        let data = Bytes::from((0..100u8).collect::<Vec<_>>());
        cache.store(&id("obj"), data.clone()).await.unwrap();

        let stream = cache.get_stream(&id("obj")).await.unwrap().unwrap();
        assert_eq!(stream.size(), 100);
        assert_eq!(stream.collect_bytes().await.unwrap(), data);
        assert!(cache.get_stream(&id("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_at_most_three() {
        let cache = MemoryCache::with_capacity(100);

        for i in 0..3 {
            cache.store(&id(&format!("o{}", i)), bytes(30, i)).await.unwrap();
        }
        // o0 becomes the most recent; o1 is now least recently used
        cache.get(&id("o0")).await.unwrap();

        cache.store(&id("o3"), bytes(30, 3)).await.unwrap();
        assert!(cache.size_bytes() <= 100);
        assert_eq!(cache.entry_count(), 3);
        assert!(!cache.exists(&id("o1")).await.unwrap());

        cache.store(&id("o4"), bytes(30, 4)).await.unwrap();
        assert_eq!(cache.entry_count(), 3);
        assert!(!cache.exists(&id("o2")).await.unwrap());

        for kept in ["o0", "o3", "o4"] {
            assert!(cache.exists(&id(kept)).await.unwrap(), "{} evicted", kept);
        }
        assert_eq!(cache.size_bytes(), 90);
        assert_eq!(cache.live_bytes(), 90);
        assert_eq!(cache.stats().await.evictions, 2);
    }

    #[tokio::test]
    async fn test_oversized_object_fails_without_evicting() {
        let cache = MemoryCache::with_capacity(100);
        cache.store(&id("keep"), bytes(50, 1)).await.unwrap();

        let err = cache.store(&id("huge"), bytes(101, 2)).await.unwrap_err();
        assert_matches!(err, Error::CapacityExceeded { tier: CacheTier::Memory, requested: 101, .. });
        assert!(cache.exists(&id("keep")).await.unwrap());
        assert_eq!(cache.size_bytes(), 50);
    }

    #[tokio::test]
    async fn test_ttl_purge_is_independent_of_access() {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            ttl_secs: 60,
            ..Default::default()
        });
        cache.store(&id("old"), bytes(10, 1)).await.unwrap();
        cache.get(&id("old")).await.unwrap();

        let now = Utc::now();
        assert_eq!(cache.purge_expired(now).await, 0);

        let later = now + chrono::Duration::seconds(61);
        cache.get(&id("old")).await.unwrap();
        assert_eq!(cache.purge_expired(later).await, 1);
        assert!(!cache.exists(&id("old")).await.unwrap());
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_clear_resets_counters() {
        let cache = MemoryCache::new();

        cache.store(&id("file1"), Bytes::from("data1")).await.unwrap();
        cache.store(&id("file2"), Bytes::from("data2")).await.unwrap();
        cache.get(&id("file1")).await.unwrap();

        cache.clear().await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.object_count, 0);
        assert_eq!(stats.size_bytes, 0);
        assert_eq!(stats.lookups(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_stores_respect_capacity() {
        let cache = Arc::new(MemoryCache::with_capacity(1000));

        let handles: Vec<_> = (0..16)
            .map(|t| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        let key = id(&format!("t{}-{}", t, i % 10));
                        let _ = cache.store(&key, bytes(37, t as u8)).await;
                        let _ = cache.get(&id(&format!("t{}-{}", (t + 1) % 16, i % 10))).await;
                        assert!(cache.size_bytes() <= 1000);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(cache.size_bytes() <= 1000);
        assert_eq!(cache.size_bytes(), cache.live_bytes());
    }
}
