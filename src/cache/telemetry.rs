//! Prometheus Telemetry
//!
//! Process-wide counters, gauges and histograms for the engine. Each
//! engine owns its own [`Registry`] so several engines can coexist in one
//! process.

use crate::cache::entry::LayerStats;
use crate::cache::events::EvictionReason;
use crate::cache::tier::{CacheTier, SizeClass};
use crate::error::Result;
use dashmap::DashMap;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

const LAYER_LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0];
const E2E_LATENCY_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];
const PRELOAD_DURATION_BUCKETS: &[f64] =
    &[10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 30000.0];

fn ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// Engine metrics registered in a private registry
pub struct EnhancedMetrics {
    registry: Registry,

    layer_hits: IntCounterVec,
    layer_misses: IntCounterVec,
    layer_errors: IntCounterVec,
    promotion_events: IntCounterVec,
    promotion_failures: IntCounterVec,
    store_failures: IntCounterVec,
    eviction_events: IntCounterVec,
    preload_success: IntCounterVec,
    preload_failure: IntCounterVec,
    bandwidth_saved: IntCounter,

    layer_size: IntGaugeVec,
    layer_objects: IntGaugeVec,
    layer_evicted: IntGaugeVec,
    concurrent_requests: IntGauge,

    layer_latency: HistogramVec,
    download_latency: Histogram,
    preload_duration: Histogram,

    /// Last (evictions, expirations) seen per tier, to turn stats into counter deltas
    last_removals: DashMap<CacheTier, (u64, u64)>,
}

impl EnhancedMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };
        let gauge_vec = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let metric = IntGaugeVec::new(Opts::new(name, help), &["layer"])?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };

        let layer_hits = counter_vec(
            "cache_layer_hits_total",
            "Downloads served by a cache layer",
            &["layer", "size_class"],
        )?;
        let layer_misses = counter_vec(
            "cache_layer_misses_total",
            "Cache layer lookups that missed",
            &["layer"],
        )?;
        let layer_errors = counter_vec(
            "cache_layer_errors_total",
            "Cache layer operations that failed and were absorbed",
            &["layer"],
        )?;
        let promotion_events = counter_vec(
            "cache_promotion_events_total",
            "Objects promoted into a faster layer",
            &["from_layer", "to_layer"],
        )?;
        let promotion_failures = counter_vec(
            "cache_promotion_failures_total",
            "Promotion writes that failed",
            &["to_layer"],
        )?;
        let store_failures = counter_vec(
            "cache_store_failures_total",
            "Fan-out writes rejected by a layer",
            &["layer", "reason"],
        )?;
        let eviction_events = counter_vec(
            "cache_eviction_events_total",
            "Entries removed from a bounded layer",
            &["layer", "reason"],
        )?;
        let preload_success = counter_vec(
            "cache_preload_success_total",
            "Objects warmed by preload",
            &["size_class"],
        )?;
        let preload_failure = counter_vec(
            "cache_preload_failure_total",
            "Preload ids that could not be warmed",
            &["reason"],
        )?;

        let bandwidth_saved = IntCounter::new(
            "cache_bandwidth_saved_bytes_total",
            "Bytes served from cache layers instead of object storage",
        )?;
        registry.register(Box::new(bandwidth_saved.clone()))?;

        let layer_size = gauge_vec("cache_layer_size_bytes", "Bytes held by a cache layer")?;
        let layer_objects = gauge_vec("cache_layer_objects", "Objects held by a cache layer")?;
        let layer_evicted = gauge_vec(
            "cache_layer_evicted_objects",
            "Entries evicted from a cache layer since its last clear",
        )?;

        let concurrent_requests =
            IntGauge::new("cache_concurrent_requests", "Downloads currently in flight")?;
        registry.register(Box::new(concurrent_requests.clone()))?;

        let layer_latency = HistogramVec::new(
            HistogramOpts::new("cache_layer_latency_ms", "Cache layer operation latency")
                .buckets(LAYER_LATENCY_BUCKETS.to_vec()),
            &["layer", "operation"],
        )?;
        registry.register(Box::new(layer_latency.clone()))?;

        let download_latency = Histogram::with_opts(
            HistogramOpts::new("download_e2e_latency_ms", "End-to-end download latency")
                .buckets(E2E_LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(download_latency.clone()))?;

        let preload_duration = Histogram::with_opts(
            HistogramOpts::new("cache_preload_duration_ms", "Duration of a preload batch")
                .buckets(PRELOAD_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(preload_duration.clone()))?;

        Ok(Self {
            registry,
            layer_hits,
            layer_misses,
            layer_errors,
            promotion_events,
            promotion_failures,
            store_failures,
            eviction_events,
            preload_success,
            preload_failure,
            bandwidth_saved,
            layer_size,
            layer_objects,
            layer_evicted,
            concurrent_requests,
            layer_latency,
            download_latency,
            preload_duration,
            last_removals: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // =========================================================================
    // Request Path
    // =========================================================================

    pub fn record_hit(&self, tier: CacheTier, size_bytes: u64) {
        self.layer_hits
            .with_label_values(&[tier.as_str(), SizeClass::for_size(size_bytes).as_str()])
            .inc();
        if tier.is_bounded() {
            self.bandwidth_saved.inc_by(size_bytes);
        }
    }

    pub fn record_miss(&self, tier: CacheTier) {
        self.layer_misses.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn record_error(&self, tier: CacheTier) {
        self.layer_errors.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn observe_layer_latency(&self, tier: CacheTier, operation: &str, elapsed: Duration) {
        self.layer_latency
            .with_label_values(&[tier.as_str(), operation])
            .observe(ms(elapsed));
    }

    pub fn observe_download(&self, elapsed: Duration) {
        self.download_latency.observe(ms(elapsed));
    }

    /// Track an in-flight download; the gauge drops when the guard does
    pub fn request_guard(&self) -> RequestGuard {
        self.concurrent_requests.inc();
        RequestGuard(self.concurrent_requests.clone())
    }

    pub fn concurrent_requests(&self) -> i64 {
        self.concurrent_requests.get()
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    pub fn record_promotion(&self, from: CacheTier, to: CacheTier) {
        self.promotion_events
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }

    pub fn record_promotion_failure(&self, to: CacheTier) {
        self.promotion_failures.with_label_values(&[to.as_str()]).inc();
    }

    pub fn record_store_failure(&self, tier: CacheTier, reason: &str) {
        self.store_failures
            .with_label_values(&[tier.as_str(), reason])
            .inc();
    }

    pub fn record_removal(&self, tier: CacheTier, reason: EvictionReason, count: u64) {
        if count > 0 {
            self.eviction_events
                .with_label_values(&[tier.as_str(), &reason.to_string()])
                .inc_by(count);
        }
    }

    // =========================================================================
    // Preload
    // =========================================================================

    pub fn record_preload_success(&self, size_bytes: u64) {
        self.preload_success
            .with_label_values(&[SizeClass::for_size(size_bytes).as_str()])
            .inc();
    }

    pub fn record_preload_failure(&self, reason: &str) {
        self.preload_failure.with_label_values(&[reason]).inc();
    }

    pub fn observe_preload(&self, elapsed: Duration) {
        self.preload_duration.observe(ms(elapsed));
    }

    // =========================================================================
    // Layer Gauges
    // =========================================================================

    /// Refresh gauges from a stats snapshot and count removals since the last one
    pub fn observe_layer(&self, stats: &LayerStats) {
        let label = [stats.tier.as_str()];
        self.layer_size
            .with_label_values(&label)
            .set(stats.size_bytes as i64);
        self.layer_objects
            .with_label_values(&label)
            .set(stats.object_count as i64);
        self.layer_evicted
            .with_label_values(&label)
            .set(stats.evictions as i64);

        let current = (stats.evictions, stats.expirations);
        let previous = self
            .last_removals
            .insert(stats.tier, current)
            .unwrap_or_default();
        // Counters restart from zero after a clear
        let delta = |now: u64, before: u64| if now >= before { now - before } else { now };
        self.record_removal(stats.tier, EvictionReason::Capacity, delta(current.0, previous.0));
        self.record_removal(stats.tier, EvictionReason::Expired, delta(current.1, previous.1));
    }

    /// Render every metric in the text exposition format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// Decrements the concurrent request gauge on drop
#[derive(Debug)]
pub struct RequestGuard(IntGauge);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(metrics: &EnhancedMetrics) -> String {
        String::from_utf8(metrics.encode().unwrap().1).unwrap()
    }

    #[test]
    fn test_engines_have_independent_registries() {
        let a = EnhancedMetrics::new().unwrap();
        let b = EnhancedMetrics::new().unwrap();

        a.record_hit(CacheTier::Memory, 10);
        assert!(rendered(&a).contains("cache_layer_hits_total{layer=\"MEMORY\",size_class=\"small\"} 1"));
        assert!(!rendered(&b).contains("cache_layer_hits_total{"));
    }

    #[test]
    fn test_bandwidth_saved_counts_bounded_tiers_only() {
        let metrics = EnhancedMetrics::new().unwrap();
        metrics.record_hit(CacheTier::Redis, 100);
        metrics.record_hit(CacheTier::ObjectStorage, 1000);
        assert!(rendered(&metrics).contains("cache_bandwidth_saved_bytes_total 100"));
    }

    #[test]
    fn test_request_guard_tracks_in_flight() {
        let metrics = EnhancedMetrics::new().unwrap();
        let first = metrics.request_guard();
        let second = metrics.request_guard();
        assert_eq!(metrics.concurrent_requests(), 2);
        drop(first);
        drop(second);
        assert_eq!(metrics.concurrent_requests(), 0);
    }

    #[test]
    fn test_observe_layer_counts_removal_deltas() {
        let metrics = EnhancedMetrics::new().unwrap();
        let mut stats = LayerStats {
            tier: CacheTier::Memory,
            object_count: 3,
            size_bytes: 90,
            evictions: 2,
            ..Default::default()
        };
        metrics.observe_layer(&stats);
        stats.evictions = 5;
        metrics.observe_layer(&stats);

        let text = rendered(&metrics);
        assert!(text.contains("cache_eviction_events_total{layer=\"MEMORY\",reason=\"capacity\"} 5"));
        assert!(text.contains("cache_layer_size_bytes{layer=\"MEMORY\"} 90"));
        assert!(text.contains("cache_layer_evicted_objects{layer=\"MEMORY\"} 5"));
    }
}
