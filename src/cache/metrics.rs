//! Cache Metrics
//!
//! Cache-line aligned counters owned by each tier, plus the engine-wide
//! request counters and the aggregate snapshot built from them.

use crate::cache::entry::LayerStats;
use crate::cache::preload::PreloadStatsSnapshot;
use crate::cache::tier::CacheTier;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Per-Layer Counters (Cache-Line Aligned)
// =============================================================================

/// Counters for a single tier, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct LayerCounters {
    /// Lookups that found the object
    pub hits: AtomicU64,
    /// Lookups that did not
    pub misses: AtomicU64,
    /// Operations that failed with an I/O or network error
    pub errors: AtomicU64,
    /// Entries removed to make room
    pub evictions: AtomicU64,
    /// Entries removed by the TTL sweep
    pub expirations: AtomicU64,
    /// Sum of timed operation latencies in microseconds
    pub latency_us_total: AtomicU64,
    /// Number of timed operations
    pub latency_ops: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

// Verify size at compile time
const _: () = assert!(std::mem::size_of::<LayerCounters>() <= CACHE_LINE_SIZE);

impl Default for LayerCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerCounters {
    /// Create new zeroed counters
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            latency_us_total: AtomicU64::new(0),
            latency_ops: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Add one timed operation to the running latency average
    #[inline]
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency_us_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter (administrative clear)
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.latency_us_total.store(0, Ordering::Relaxed);
        self.latency_ops.store(0, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        ratio(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Mean latency of timed operations in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        let ops = self.latency_ops.load(Ordering::Relaxed);
        if ops == 0 {
            0.0
        } else {
            self.latency_us_total.load(Ordering::Relaxed) as f64 / ops as f64 / 1000.0
        }
    }

    /// Combine counters with the tier's occupancy into a stats snapshot
    pub fn layer_stats(
        &self,
        tier: CacheTier,
        object_count: u64,
        size_bytes: u64,
        capacity_bytes: Option<u64>,
    ) -> LayerStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        LayerStats {
            name: tier.as_str().to_string(),
            tier,
            object_count,
            size_bytes,
            capacity_bytes,
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: ratio(hits, misses),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

// =============================================================================
// Engine Request Counters
// =============================================================================

/// Engine-wide download and promotion counters
#[derive(Debug, Default)]
pub struct RequestCounters {
    /// Downloads served by a bounded tier
    pub cache_hits: AtomicU64,
    /// Downloads that fell through to the backend
    pub cache_misses: AtomicU64,
    /// Downloads for objects nobody holds
    pub not_found: AtomicU64,
    /// Downloads that failed at the backend
    pub backend_errors: AtomicU64,
    /// Successful promotion writes
    pub promotions: AtomicU64,
    /// Failed promotion writes
    pub promotion_failures: AtomicU64,
    /// Bytes served from a bounded tier instead of the backend
    pub bytes_served_from_cache: AtomicU64,
}

impl RequestCounters {
    pub fn snapshot(&self) -> RequestCountersSnapshot {
        RequestCountersSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            promotion_failures: self.promotion_failures.load(Ordering::Relaxed),
            bytes_served_from_cache: self.bytes_served_from_cache.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.not_found.store(0, Ordering::Relaxed);
        self.backend_errors.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.promotion_failures.store(0, Ordering::Relaxed);
        self.bytes_served_from_cache.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCountersSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub not_found: u64,
    pub backend_errors: u64,
    pub promotions: u64,
    pub promotion_failures: u64,
    pub bytes_served_from_cache: u64,
}

// =============================================================================
// Aggregate Cache Statistics
// =============================================================================

/// Aggregate statistics across the bounded tiers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Downloads answered by any bounded tier
    pub hits: u64,
    /// Downloads that had to go to the backend
    pub misses: u64,
    pub hit_rate: f64,
    /// Bytes held across bounded tiers (an object in two tiers counts twice)
    pub total_size_bytes: u64,
    pub total_objects: u64,
}

impl AggregateStats {
    /// Build from per-layer stats and the engine's request counters
    pub fn from_layers(layers: &[LayerStats], requests: &RequestCountersSnapshot) -> Self {
        let bounded = layers.iter().filter(|l| l.tier.is_bounded());
        let (total_size_bytes, total_objects) = bounded
            .fold((0, 0), |(size, count), l| (size + l.size_bytes, count + l.object_count));

        Self {
            hits: requests.cache_hits,
            misses: requests.cache_misses,
            hit_rate: ratio(requests.cache_hits, requests.cache_misses),
            total_size_bytes,
            total_objects,
        }
    }
}

/// Full engine snapshot for dashboards
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub layers: Vec<LayerStats>,
    pub aggregate: AggregateStats,
    pub requests: RequestCountersSnapshot,
    pub preload: PreloadStatsSnapshot,
}

impl EngineStats {
    /// Get stats for one tier
    pub fn layer(&self, tier: CacheTier) -> Option<&LayerStats> {
        self.layers.iter().find(|l| l.tier == tier)
    }
}
