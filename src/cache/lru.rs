//! Sharded LRU Tracker
//!
//! A 64-way sharded recency index shared by the bounded tiers. Each shard
//! keeps its ids in access order (front = least recently used), stamped with
//! a tick from a tracker-wide logical clock, so the global LRU victim is the
//! smallest front tick across shards: eviction inspects 64 shard heads
//! instead of every tracked entry.

use crate::cache::entry::ObjectId;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Constants
// =============================================================================

/// Number of shards for LRU tracking (64 for good distribution)
pub const LRU_SHARD_COUNT: usize = 64;

/// How many times `pop_lru` re-scans when a concurrent access moves the
/// chosen victim before it can be removed
const POP_RETRIES: usize = 8;

// =============================================================================
// Eviction Candidate
// =============================================================================

/// An entry removed from the recency index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub id: ObjectId,
    pub size_bytes: u64,
    /// Logical time of the last access
    pub last_tick: u64,
}

#[derive(Debug, Clone, Copy)]
struct LruSlot {
    size_bytes: u64,
    last_tick: u64,
}

// =============================================================================
// LRU Shard
// =============================================================================

#[derive(Debug)]
struct LruShard {
    /// Entries in LRU order (front = oldest, back = newest)
    entries: IndexMap<ObjectId, LruSlot>,
    /// Total bytes tracked in this shard
    total_bytes: u64,
}

impl LruShard {
    fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            total_bytes: 0,
        }
    }

    /// Track a new or replaced entry at the back; returns the replaced size
    fn track(&mut self, id: ObjectId, size_bytes: u64, tick: u64) -> Option<u64> {
        let old = self.entries.shift_remove(&id).map(|old| {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
            old.size_bytes
        });
        self.total_bytes += size_bytes;
        self.entries.insert(
            id,
            LruSlot {
                size_bytes,
                last_tick: tick,
            },
        );
        old
    }

    /// Move to back = most recently used
    fn access(&mut self, id: &ObjectId, tick: u64) -> bool {
        match self.entries.shift_remove_entry(id) {
            Some((id, mut slot)) => {
                slot.last_tick = tick;
                self.entries.insert(id, slot);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &ObjectId) -> Option<LruSlot> {
        let slot = self.entries.shift_remove(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.size_bytes);
        Some(slot)
    }

    fn front_tick(&self) -> Option<u64> {
        self.entries.first().map(|(_, slot)| slot.last_tick)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

// =============================================================================
// Sharded LRU Tracker
// =============================================================================

/// 64-way sharded LRU tracker for concurrent access
pub struct ShardedLruTracker {
    shards: Box<[RwLock<LruShard>; LRU_SHARD_COUNT]>,
    entry_count: AtomicU64,
    clock: AtomicU64,
}

impl ShardedLruTracker {
    /// Create a new sharded LRU tracker
    pub fn new() -> Self {
        Self {
            shards: Box::new(std::array::from_fn(|_| RwLock::new(LruShard::new()))),
            entry_count: AtomicU64::new(0),
            clock: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_for(&self, id: &ObjectId) -> &RwLock<LruShard> {
        &self.shards[id.shard_index()]
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Track a new or replaced entry as most recently used
    pub fn track(&self, id: &ObjectId, size_bytes: u64) {
        let mut shard = self.shard_for(id).write();
        // Tick is taken under the shard lock so ticks stay ordered within a shard
        let tick = self.tick();
        if shard.track(id.clone(), size_bytes, tick).is_none() {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record access to an entry (updates LRU position)
    pub fn access(&self, id: &ObjectId) -> bool {
        let mut shard = self.shard_for(id).write();
        let tick = self.tick();
        shard.access(id, tick)
    }

    /// Remove an entry from tracking, returning its size
    pub fn remove(&self, id: &ObjectId) -> Option<u64> {
        let removed = self.shard_for(id).write().remove(id);
        if removed.is_some() {
            self.entry_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed.map(|slot| slot.size_bytes)
    }

    /// Peek at the least recently used entry without removing it
    pub fn peek_lru(&self) -> Option<EvictionCandidate> {
        let index = self.oldest_shard()?;
        let shard = self.shards[index].read();
        shard.entries.first().map(|(id, slot)| EvictionCandidate {
            id: id.clone(),
            size_bytes: slot.size_bytes,
            last_tick: slot.last_tick,
        })
    }

    /// Remove and return the least recently used entry across all shards
    pub fn pop_lru(&self) -> Option<EvictionCandidate> {
        for _ in 0..POP_RETRIES {
            let index = self.oldest_shard()?;
            let mut shard = self.shards[index].write();
            let expected = self.oldest_tick_in_other_shards(index);

            // The head may have moved since the scan; only take it if it is
            // still older than every other shard head we saw
            let Some(front_tick) = shard.front_tick() else {
                continue;
            };
            if expected.is_some_and(|other| other < front_tick) {
                continue;
            }

            if let Some((id, slot)) = shard.entries.shift_remove_index(0) {
                shard.total_bytes = shard.total_bytes.saturating_sub(slot.size_bytes);
                self.entry_count.fetch_sub(1, Ordering::Relaxed);
                return Some(EvictionCandidate {
                    id,
                    size_bytes: slot.size_bytes,
                    last_tick: slot.last_tick,
                });
            }
        }
        None
    }

    fn oldest_shard(&self) -> Option<usize> {
        self.shards
            .iter()
            .enumerate()
            .filter_map(|(i, shard)| shard.read().front_tick().map(|tick| (i, tick)))
            .min_by_key(|(_, tick)| *tick)
            .map(|(i, _)| i)
    }

    fn oldest_tick_in_other_shards(&self, skip: usize) -> Option<u64> {
        self.shards
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != skip)
            .filter_map(|(_, shard)| shard.try_read().and_then(|s| s.front_tick()))
            .min()
    }

    /// Check whether an id is tracked
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.shard_for(id).read().entries.contains_key(id)
    }

    /// Get total entry count
    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Get total bytes tracked
    pub fn total_bytes(&self) -> u64 {
        self.shards.iter().map(|shard| shard.read().total_bytes).sum()
    }

    /// Clear all entries
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
        self.entry_count.store(0, Ordering::Relaxed);
    }
}

impl Default for ShardedLruTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    #[test]
    fn test_track_and_access() {
        let tracker = ShardedLruTracker::new();

        tracker.track(&id("file1"), 1000);
        assert_eq!(tracker.entry_count(), 1);
        assert_eq!(tracker.total_bytes(), 1000);

        assert!(tracker.access(&id("file1")));
        assert!(!tracker.access(&id("nonexistent")));
    }

    #[test]
    fn test_replace_does_not_double_count() {
        let tracker = ShardedLruTracker::new();

        tracker.track(&id("file1"), 1000);
        tracker.track(&id("file1"), 400);
        assert_eq!(tracker.entry_count(), 1);
        assert_eq!(tracker.total_bytes(), 400);
    }

    #[test]
    fn test_remove() {
        let tracker = ShardedLruTracker::new();

        tracker.track(&id("file1"), 1000);
        tracker.track(&id("file2"), 2000);
        assert_eq!(tracker.remove(&id("file1")), Some(1000));
        assert_eq!(tracker.remove(&id("file1")), None);
        assert_eq!(tracker.entry_count(), 1);
        assert!(!tracker.contains(&id("file1")));
        assert!(tracker.contains(&id("file2")));
    }

    #[test]
    fn test_pop_lru_follows_access_order() {
        let tracker = ShardedLruTracker::new();

        for i in 0..10 {
            tracker.track(&id(&format!("file{}", i)), 100);
        }
        // Touch the two oldest so they become the newest
        tracker.access(&id("file0"));
        tracker.access(&id("file1"));

        let order: Vec<String> = std::iter::from_fn(|| tracker.pop_lru())
            .map(|c| c.id.to_string())
            .collect();

        assert_eq!(order.len(), 10);
        assert_eq!(&order[..3], &["file2", "file3", "file4"]);
        assert_eq!(&order[8..], &["file0", "file1"]);
        assert_eq!(tracker.entry_count(), 0);
        assert_eq!(tracker.total_bytes(), 0);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let tracker = ShardedLruTracker::new();
        assert!(tracker.peek_lru().is_none());

        tracker.track(&id("a"), 1);
        tracker.track(&id("b"), 2);

        let peeked = tracker.peek_lru().unwrap();
        assert_eq!(peeked.id, id("a"));
        assert_eq!(tracker.entry_count(), 2);
        assert_eq!(tracker.pop_lru().unwrap(), peeked);
    }

    #[test]
    fn test_clear() {
        let tracker = ShardedLruTracker::new();

        tracker.track(&id("a"), 100);
        tracker.track(&id("b"), 100);
        tracker.clear();

        assert_eq!(tracker.entry_count(), 0);
        assert_eq!(tracker.total_bytes(), 0);
        assert!(tracker.pop_lru().is_none());
    }
}
