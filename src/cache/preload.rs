//! Cache Preloader
//!
//! Warms the bounded tiers ahead of anticipated requests. Ids are processed
//! independently with bounded concurrency; a partially failed batch is an
//! ordinary result, never an error.

use crate::cache::entry::ObjectId;
use crate::cache::storage::ObjectStorageBackend;
use crate::cache::telemetry::EnhancedMetrics;
use crate::cache::tier::{CacheTier, SizeClass};
use crate::cache::{CacheLayer, CacheLayerRef};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Preload Configuration
// =============================================================================

/// Configuration for the preloader
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Maximum ids processed at once
    pub max_concurrent: usize,
    /// Whether preloading is enabled
    pub enabled: bool,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            enabled: true,
        }
    }
}

// =============================================================================
// Preload Stats
// =============================================================================

/// Process-wide preload counters
#[derive(Debug, Default)]
pub struct PreloadStats {
    /// Preload batches received
    pub batches: AtomicU64,
    /// Ids requested across all batches
    pub ids_requested: AtomicU64,
    /// Ids written into at least one tier
    pub ids_loaded: AtomicU64,
    /// Ids already held by every eligible tier
    pub ids_cached: AtomicU64,
    /// Ids with no eligible tier
    pub ids_skipped: AtomicU64,
    pub ids_failed: AtomicU64,
    pub bytes_loaded: AtomicU64,
    /// Ids currently being processed
    pub in_flight: AtomicU64,
}

impl PreloadStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> PreloadStatsSnapshot {
        PreloadStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            ids_requested: self.ids_requested.load(Ordering::Relaxed),
            ids_loaded: self.ids_loaded.load(Ordering::Relaxed),
            ids_cached: self.ids_cached.load(Ordering::Relaxed),
            ids_skipped: self.ids_skipped.load(Ordering::Relaxed),
            ids_failed: self.ids_failed.load(Ordering::Relaxed),
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of preload statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadStatsSnapshot {
    pub batches: u64,
    pub ids_requested: u64,
    pub ids_loaded: u64,
    pub ids_cached: u64,
    pub ids_skipped: u64,
    pub ids_failed: u64,
    pub bytes_loaded: u64,
    pub in_flight: u64,
}

impl PreloadStatsSnapshot {
    /// Ids that were already cached / total requested
    pub fn cache_hit_ratio(&self) -> f64 {
        if self.ids_requested == 0 {
            0.0
        } else {
            self.ids_cached as f64 / self.ids_requested as f64
        }
    }

    /// Ids that did not fail / total requested
    pub fn success_ratio(&self) -> f64 {
        if self.ids_requested == 0 {
            0.0
        } else {
            (self.ids_requested - self.ids_failed) as f64 / self.ids_requested as f64
        }
    }
}

// =============================================================================
// Preload Report
// =============================================================================

/// What happened to one id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PreloadOutcome {
    /// Written into these tiers
    Loaded { tiers: Vec<CacheTier>, bytes: u64 },
    /// Every eligible tier already held it
    AlreadyCached,
    /// Nothing to do (too large for any tier, or preloading disabled)
    Skipped { reason: String },
    Failed { reason: String },
}

impl PreloadOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PreloadOutcome::Failed { .. })
    }

    fn failed(reason: impl Into<String>) -> Self {
        PreloadOutcome::Failed {
            reason: reason.into(),
        }
    }
}

/// One id's entry in a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadItem {
    pub id: ObjectId,
    pub outcome: PreloadOutcome,
    pub latency_ms: f64,
}

/// Per-tier counts for a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerPreloadSummary {
    pub loaded: usize,
    pub failed: usize,
    /// Already present or not eligible
    pub skipped: usize,
    pub bytes: u64,
}

/// Result of a preload batch, in input order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreloadReport {
    pub items: Vec<PreloadItem>,
    pub layers: HashMap<CacheTier, LayerPreloadSummary>,
    pub duration_ms: f64,
}

impl PreloadReport {
    pub fn requested(&self) -> usize {
        self.items.len()
    }

    /// Ids that did not fail
    pub fn succeeded(&self) -> Vec<&ObjectId> {
        self.items
            .iter()
            .filter(|item| !item.outcome.is_failure())
            .map(|item| &item.id)
            .collect()
    }

    /// Failed ids with their reasons
    pub fn failed(&self) -> Vec<(&ObjectId, &str)> {
        self.items
            .iter()
            .filter_map(|item| match &item.outcome {
                PreloadOutcome::Failed { reason } => Some((&item.id, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn outcome(&self, id: &ObjectId) -> Option<&PreloadOutcome> {
        self.items
            .iter()
            .find(|item| &item.id == id)
            .map(|item| &item.outcome)
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.items
            .iter()
            .map(|item| match &item.outcome {
                PreloadOutcome::Loaded { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn layer(&self, tier: CacheTier) -> Option<&LayerPreloadSummary> {
        self.layers.get(&tier)
    }

    /// Human-readable one-paragraph summary
    pub fn summary(&self) -> String {
        let requested = self.requested();
        let success_pct = if requested == 0 {
            0.0
        } else {
            self.succeeded().len() as f64 / requested as f64 * 100.0
        };
        let mut summary = format!(
            "Preload: {} objects ({:.2}% success), {:.2} MB loaded in {:.2} ms",
            requested,
            success_pct,
            self.bytes_loaded() as f64 / (1024.0 * 1024.0),
            self.duration_ms,
        );
        for tier in CacheTier::lookup_order() {
            if let Some(layer) = self.layers.get(tier) {
                let _ = write!(
                    summary,
                    "\n  {}: {} loaded, {} failed, {} skipped",
                    tier, layer.loaded, layer.failed, layer.skipped
                );
            }
        }
        summary
    }
}

// =============================================================================
// Preloader
// =============================================================================

/// Per-id work: the outcome plus what each tier did
struct ItemRun {
    outcome: PreloadOutcome,
    per_tier: Vec<(CacheTier, TierResult)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TierResult {
    Loaded(u64),
    Failed,
    Skipped,
}

/// Runs preload batches against a set of bounded tiers
pub struct Preloader {
    config: PreloadConfig,
    stats: PreloadStats,
}

impl Preloader {
    pub fn new() -> Self {
        Self::with_config(PreloadConfig::default())
    }

    pub fn with_config(config: PreloadConfig) -> Self {
        Self {
            config,
            stats: PreloadStats::default(),
        }
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.config
    }

    pub fn stats(&self) -> PreloadStatsSnapshot {
        self.stats.snapshot()
    }

    /// Warm `tiers` (fastest first) with every id in `ids`
    pub async fn run(
        &self,
        ids: Vec<ObjectId>,
        tiers: &[CacheLayerRef],
        backend: &ObjectStorageBackend,
        metrics: &EnhancedMetrics,
    ) -> PreloadReport {
        let start = Instant::now();
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .ids_requested
            .fetch_add(ids.len() as u64, Ordering::Relaxed);

        let mut runs: Vec<(usize, ObjectId, ItemRun, Duration)> =
            stream::iter(ids.into_iter().enumerate())
                .map(|(index, id)| async move {
                    let item_start = Instant::now();
                    self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
                    let run = self.preload_one(&id, tiers, backend).await;
                    self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
                    (index, id, run, item_start.elapsed())
                })
                .buffer_unordered(self.config.max_concurrent.max(1))
                .collect()
                .await;
        runs.sort_by_key(|(index, ..)| *index);

        let mut report = PreloadReport::default();
        for (_, id, run, elapsed) in runs {
            self.account(&run.outcome, metrics);
            for (tier, result) in run.per_tier {
                let layer = report.layers.entry(tier).or_default();
                match result {
                    TierResult::Loaded(bytes) => {
                        layer.loaded += 1;
                        layer.bytes += bytes;
                    }
                    TierResult::Failed => layer.failed += 1,
                    TierResult::Skipped => layer.skipped += 1,
                }
            }
            report.items.push(PreloadItem {
                id,
                outcome: run.outcome,
                latency_ms: elapsed.as_secs_f64() * 1000.0,
            });
        }

        let elapsed = start.elapsed();
        report.duration_ms = elapsed.as_secs_f64() * 1000.0;
        metrics.observe_preload(elapsed);
        info!(
            requested = report.requested(),
            failed = report.failed().len(),
            bytes = report.bytes_loaded(),
            duration_ms = report.duration_ms,
            "Preload batch complete"
        );
        report
    }

    fn account(&self, outcome: &PreloadOutcome, metrics: &EnhancedMetrics) {
        match outcome {
            PreloadOutcome::Loaded { bytes, .. } => {
                self.stats.ids_loaded.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_loaded.fetch_add(*bytes, Ordering::Relaxed);
                metrics.record_preload_success(*bytes);
            }
            PreloadOutcome::AlreadyCached => {
                self.stats.ids_cached.fetch_add(1, Ordering::Relaxed);
            }
            PreloadOutcome::Skipped { .. } => {
                self.stats.ids_skipped.fetch_add(1, Ordering::Relaxed);
            }
            PreloadOutcome::Failed { reason } => {
                self.stats.ids_failed.fetch_add(1, Ordering::Relaxed);
                metrics.record_preload_failure(reason);
            }
        }
    }

    async fn preload_one(
        &self,
        id: &ObjectId,
        tiers: &[CacheLayerRef],
        backend: &ObjectStorageBackend,
    ) -> ItemRun {
        let finish = |outcome| ItemRun {
            outcome,
            per_tier: Vec::new(),
        };

        if !self.config.enabled {
            return finish(PreloadOutcome::Skipped {
                reason: "disabled".to_string(),
            });
        }

        let size = match backend.head(id).await {
            Ok(Some(size)) => size,
            Ok(None) => return finish(PreloadOutcome::failed("not_found")),
            Err(e) => {
                warn!(object_id = %id, error = %e, "Preload size lookup failed");
                return finish(PreloadOutcome::failed("backend"));
            }
        };

        let mut per_tier = Vec::with_capacity(tiers.len());
        let mut missing = Vec::new();
        for tier in tiers {
            if !tier.accepts(size) {
                per_tier.push((tier.tier(), TierResult::Skipped));
                continue;
            }
            match tier.exists(id).await {
                Ok(true) => per_tier.push((tier.tier(), TierResult::Skipped)),
                _ => missing.push(tier),
            }
        }

        if missing.is_empty() {
            let eligible = tiers.iter().any(|t| t.accepts(size));
            let outcome = if eligible {
                PreloadOutcome::AlreadyCached
            } else {
                PreloadOutcome::Skipped {
                    reason: format!("{} object fits no cache tier", SizeClass::for_size(size)),
                }
            };
            return ItemRun { outcome, per_tier };
        }

        let data = match backend.get(id).await {
            Ok(Some(data)) => data,
            Ok(None) => return finish(PreloadOutcome::failed("not_found")),
            Err(e) => {
                warn!(object_id = %id, error = %e, "Preload fetch failed");
                return finish(PreloadOutcome::failed("backend"));
            }
        };

        let bytes = data.len() as u64;
        let mut loaded = Vec::new();
        for tier in missing {
            match tier.store(id, data.clone()).await {
                Ok(()) => {
                    loaded.push(tier.tier());
                    per_tier.push((tier.tier(), TierResult::Loaded(bytes)));
                }
                Err(e) => {
                    debug!(object_id = %id, tier = %tier.tier(), error = %e, "Preload store rejected");
                    per_tier.push((tier.tier(), TierResult::Failed));
                }
            }
        }

        let outcome = if loaded.is_empty() {
            PreloadOutcome::failed("store_rejected")
        } else {
            PreloadOutcome::Loaded {
                tiers: loaded,
                bytes,
            }
        };
        ItemRun { outcome, per_tier }
    }
}

impl Default for Preloader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::{MemoryCache, MemoryCacheConfig};
    use bytes::Bytes;
    use std::sync::Arc;

    fn small_memory(max_object_size: u64) -> Arc<MemoryCache> {
        Arc::new(MemoryCache::with_config(MemoryCacheConfig {
            capacity_bytes: 1024,
            max_object_size,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort_batch() {
        let (backend, store) = ObjectStorageBackend::in_memory();
        for key in ["A", "B", "C"] {
            backend.store(&ObjectId::new(key), Bytes::from("payload")).await.unwrap();
        }
        store.fail_key("B");

        let memory = small_memory(512);
        let tiers: Vec<CacheLayerRef> = vec![memory.clone()];
        let metrics = EnhancedMetrics::new().unwrap();
        let preloader = Preloader::new();

        let ids = vec![ObjectId::new("A"), ObjectId::new("B"), ObjectId::new("C")];
        let report = preloader.run(ids, &tiers, &backend, &metrics).await;

        let order: Vec<_> = report.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert_eq!(report.succeeded(), vec![&ObjectId::new("A"), &ObjectId::new("C")]);
        assert_eq!(report.failed(), vec![(&ObjectId::new("B"), "backend")]);
        assert!(memory.exists(&ObjectId::new("C")).await.unwrap());
        assert_eq!(report.layer(CacheTier::Memory).unwrap().loaded, 2);

        let stats = preloader.stats();
        assert_eq!(stats.ids_requested, 3);
        assert_eq!(stats.ids_loaded, 2);
        assert_eq!(stats.ids_failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_outcomes_for_cached_missing_and_oversized() {
        let (backend, _store) = ObjectStorageBackend::in_memory();
        backend.store(&ObjectId::new("warm"), Bytes::from("1234")).await.unwrap();
        backend.store(&ObjectId::new("huge"), Bytes::from(vec![0u8; 64])).await.unwrap();

        let memory = small_memory(16);
        memory.store(&ObjectId::new("warm"), Bytes::from("1234")).await.unwrap();
        let tiers: Vec<CacheLayerRef> = vec![memory.clone()];
        let metrics = EnhancedMetrics::new().unwrap();
        let preloader = Preloader::new();

        let report = preloader
            .run(
                vec![ObjectId::new("warm"), ObjectId::new("ghost"), ObjectId::new("huge")],
                &tiers,
                &backend,
                &metrics,
            )
            .await;

        assert_eq!(report.outcome(&ObjectId::new("warm")), Some(&PreloadOutcome::AlreadyCached));
        assert_eq!(
            report.outcome(&ObjectId::new("ghost")),
            Some(&PreloadOutcome::Failed { reason: "not_found".into() })
        );
        assert!(matches!(
            report.outcome(&ObjectId::new("huge")),
            Some(PreloadOutcome::Skipped { .. })
        ));
        assert!(!memory.exists(&ObjectId::new("huge")).await.unwrap());
        assert!(report.summary().starts_with("Preload: 3 objects"));
    }

    #[tokio::test]
    async fn test_disabled_preloader_skips() {
        let (backend, _store) = ObjectStorageBackend::in_memory();
        let metrics = EnhancedMetrics::new().unwrap();
        let preloader = Preloader::with_config(PreloadConfig {
            enabled: false,
            ..Default::default()
        });

        let report = preloader
            .run(vec![ObjectId::new("x")], &[], &backend, &metrics)
            .await;
        assert!(report.failed().is_empty());
        assert_eq!(preloader.stats().ids_skipped, 1);
    }

    #[test]
    fn test_stats_ratios() {
        let stats = PreloadStatsSnapshot {
            ids_requested: 100,
            ids_cached: 30,
            ids_failed: 10,
            ..Default::default()
        };

        assert!((stats.cache_hit_ratio() - 0.3).abs() < 0.001);
        assert!((stats.success_ratio() - 0.9).abs() < 0.001);
    }
}
