//! Cache Entry Types
//!
//! Object identifiers, per-tier entry metadata and the per-tier stats snapshot.

use crate::cache::tier::CacheTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Object Id
// =============================================================================

/// Opaque object identifier, the cache key in every tier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap an identifier handed over by the metadata layer
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the shard index for this id (64-way sharding)
    #[inline]
    pub fn shard_index(&self) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % 64
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for ObjectId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Metadata a bounded tier keeps for every object it holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Object size in bytes
    pub size_bytes: u64,
    /// When the entry was stored in this tier
    pub created_at: DateTime<Utc>,
    /// Last successful read
    pub last_accessed: DateTime<Utc>,
    /// Successful reads since the entry was stored
    pub access_count: u64,
}

impl CacheEntry {
    /// Create metadata for a freshly stored object
    pub fn new(size_bytes: u64) -> Self {
        Self::created_at(size_bytes, Utc::now())
    }

    /// Create metadata with an explicit creation time
    pub fn created_at(size_bytes: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            size_bytes,
            created_at,
            last_accessed: created_at,
            access_count: 0,
        }
    }

    /// Record a successful read
    pub fn record_access(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }

    /// Time since the entry was stored
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }

    /// TTL is measured from creation; reads do not extend it
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age_ms = self.age_at(now).num_milliseconds();
        age_ms >= 0 && age_ms as u128 >= ttl.as_millis()
    }
}

// =============================================================================
// Layer Stats
// =============================================================================

/// Point-in-time statistics for one tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub name: String,
    pub tier: CacheTier,
    pub object_count: u64,
    pub size_bytes: u64,
    /// `None` for the unbounded backend
    pub capacity_bytes: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    /// Failed operations (TierUnavailable)
    pub errors: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// hits / (hits + misses), 0.0 when there were no lookups
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
}

impl LayerStats {
    /// Total lookups (hits + misses)
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}
