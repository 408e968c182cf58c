//! Request Latency Trace
//!
//! One [`LatencyMetrics`] per download. Each stage the request passes
//! through (DB lookup, every tier attempt, backend fetch, first byte,
//! stream, promotion) records its duration in milliseconds. The finished
//! trace is flattened into response headers.
//!
//! The trace outlives the call that opened it: the response stream and the
//! promotion task both write into it, so it is shared through a
//! [`TraceHandle`].

use crate::cache::entry::ObjectId;
use crate::cache::tier::CacheTier;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stage key for the caller-supplied metadata lookup
pub const STAGE_DB_LOOKUP: &str = "db_lookup";
pub const STAGE_BACKEND: &str = "backend";
pub const STAGE_FIRST_BYTE: &str = "first_byte";
pub const STAGE_STREAM: &str = "stream";
pub const STAGE_PROMOTION: &str = "promotion";
pub const STAGE_TOTAL: &str = "total";
/// Sum of all tier attempts
pub const STAGE_CACHE_WATERFALL: &str = "cache_waterfall";

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_micros() as f64 / 1000.0
}

fn format_ms(ms: f64) -> String {
    format!("{:.2}", ms)
}

// =============================================================================
// Layer Attempts
// =============================================================================

/// An in-progress tier lookup; hand it back to [`LatencyMetrics::end_layer`]
#[derive(Debug)]
#[must_use = "an attempt is only recorded once it is ended"]
pub struct LayerAttempt {
    tier: CacheTier,
    started: Instant,
}

impl LayerAttempt {
    pub fn tier(&self) -> CacheTier {
        self.tier
    }
}

/// A finished tier lookup
#[derive(Debug, Clone, Serialize)]
pub struct LayerTiming {
    pub tier: CacheTier,
    pub latency_ms: f64,
    pub hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub object_size: u64,
}

// =============================================================================
// Latency Metrics
// =============================================================================

/// Per-request latency trace
#[derive(Debug, Serialize)]
pub struct LatencyMetrics {
    pub object_id: ObjectId,
    pub object_size: u64,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_layer_used: Option<CacheTier>,
    pub layers: Vec<LayerTiming>,
    /// Stage name to milliseconds
    pub timings: BTreeMap<String, f64>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    db_lookup_started: Option<Instant>,
    #[serde(skip)]
    backend_started: Option<Instant>,
    #[serde(skip)]
    stream_started: Option<Instant>,
}

impl LatencyMetrics {
    /// Open a trace; the total clock starts now
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            object_size: 0,
            cache_hit: false,
            cache_layer_used: None,
            layers: Vec::new(),
            timings: BTreeMap::new(),
            started: Instant::now(),
            db_lookup_started: None,
            backend_started: None,
            stream_started: None,
        }
    }

    pub fn start_db_lookup(&mut self) {
        self.db_lookup_started = Some(Instant::now());
    }

    pub fn end_db_lookup(&mut self) {
        if let Some(started) = self.db_lookup_started.take() {
            self.record_stage(STAGE_DB_LOOKUP, started.elapsed());
        }
    }

    /// Record a lookup the caller timed itself
    pub fn record_db_lookup(&mut self, elapsed: Duration) {
        self.record_stage(STAGE_DB_LOOKUP, elapsed);
    }

    pub fn start_layer(&self, tier: CacheTier) -> LayerAttempt {
        LayerAttempt {
            tier,
            started: Instant::now(),
        }
    }

    /// Close a tier attempt; a hit makes that tier the layer used
    pub fn end_layer(
        &mut self,
        attempt: LayerAttempt,
        hit: bool,
        error: Option<&crate::error::Error>,
        object_size: u64,
    ) {
        let latency_ms = millis(attempt.started.elapsed());
        self.timings
            .insert(format!("cache_{}", attempt.tier), latency_ms);
        self.layers.push(LayerTiming {
            tier: attempt.tier,
            latency_ms,
            hit,
            error: error.map(ToString::to_string),
            object_size,
        });

        if hit {
            self.cache_hit = true;
            self.cache_layer_used = Some(attempt.tier);
            self.object_size = object_size;
        }
    }

    pub fn start_backend(&mut self) {
        self.backend_started = Some(Instant::now());
    }

    pub fn end_backend(&mut self) {
        if let Some(started) = self.backend_started.take() {
            self.record_stage(STAGE_BACKEND, started.elapsed());
        }
    }

    pub fn start_stream(&mut self) {
        self.stream_started = Some(Instant::now());
    }

    pub fn end_stream(&mut self) {
        if let Some(started) = self.stream_started.take() {
            self.record_stage(STAGE_STREAM, started.elapsed());
        }
    }

    /// Time from trace open to the first byte handed to the caller; only the first call counts
    pub fn record_first_byte(&mut self) {
        if !self.timings.contains_key(STAGE_FIRST_BYTE) {
            let elapsed = self.started.elapsed();
            self.record_stage(STAGE_FIRST_BYTE, elapsed);
        }
    }

    pub fn record_promotion(&mut self, elapsed: Duration) {
        self.record_stage(STAGE_PROMOTION, elapsed);
    }

    pub fn set_object_size(&mut self, size: u64) {
        self.object_size = size;
    }

    /// Stamp the total and the waterfall sum; may be called again to extend the total
    pub fn finalize(&mut self) {
        let elapsed = self.started.elapsed();
        self.record_stage(STAGE_TOTAL, elapsed);

        let waterfall: f64 = self.layers.iter().map(|l| l.latency_ms).sum();
        if waterfall > 0.0 {
            self.timings
                .insert(STAGE_CACHE_WATERFALL.to_string(), waterfall);
        }
    }

    fn record_stage(&mut self, stage: &str, elapsed: Duration) {
        self.timings.insert(stage.to_string(), millis(elapsed));
    }

    /// Milliseconds recorded for a stage
    pub fn stage_ms(&self, stage: &str) -> Option<f64> {
        self.timings.get(stage).copied()
    }

    pub fn attempt(&self, tier: CacheTier) -> Option<&LayerTiming> {
        self.layers.iter().find(|l| l.tier == tier)
    }

    /// Flatten into response headers
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        let stage = |name: &str| format_ms(self.stage_ms(name).unwrap_or(0.0));

        headers.insert("X-Latency-Total-Ms".to_string(), stage(STAGE_TOTAL));
        headers.insert("X-Latency-DB-Lookup-Ms".to_string(), stage(STAGE_DB_LOOKUP));
        headers.insert("X-Latency-First-Byte-Ms".to_string(), stage(STAGE_FIRST_BYTE));

        headers.insert("X-Cache-Hit".to_string(), self.cache_hit.to_string());
        if let (true, Some(layer)) = (self.cache_hit, self.cache_layer_used) {
            headers.insert("X-Cache-Layer-Used".to_string(), layer.to_string());
        }

        for layer in &self.layers {
            headers.insert(
                format!("X-Latency-Cache-{}-Ms", layer.tier),
                format_ms(layer.latency_ms),
            );
            if layer.hit {
                headers.insert(format!("X-Cache-{}-Hit", layer.tier), "true".to_string());
            }
            if let Some(error) = &layer.error {
                headers.insert(format!("X-Cache-{}-Error", layer.tier), error.clone());
            }
        }

        for (stage_name, header) in [
            (STAGE_BACKEND, "X-Latency-Backend-Ms"),
            (STAGE_STREAM, "X-Latency-Stream-Ms"),
            (STAGE_PROMOTION, "X-Latency-Promotion-Ms"),
            (STAGE_CACHE_WATERFALL, "X-Latency-Cache-Waterfall-Ms"),
        ] {
            if let Some(ms) = self.stage_ms(stage_name) {
                headers.insert(header.to_string(), format_ms(ms));
            }
        }

        headers.insert("X-Object-Size-Bytes".to_string(), self.object_size.to_string());
        headers
    }
}

// =============================================================================
// Shared Trace Handle
// =============================================================================

/// Cloneable handle to a trace shared by the request, its stream and its promotion
#[derive(Debug, Clone)]
pub struct TraceHandle(Arc<Mutex<LatencyMetrics>>);

impl TraceHandle {
    pub fn new(object_id: ObjectId) -> Self {
        Self::from(LatencyMetrics::new(object_id))
    }

    /// Mutate the trace under its lock
    pub fn update<R>(&self, f: impl FnOnce(&mut LatencyMetrics) -> R) -> R {
        f(&mut self.0.lock())
    }

    /// Read the trace under its lock
    pub fn read<R>(&self, f: impl FnOnce(&LatencyMetrics) -> R) -> R {
        f(&self.0.lock())
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        self.read(LatencyMetrics::headers)
    }

    pub fn stage_ms(&self, stage: &str) -> Option<f64> {
        self.read(|m| m.stage_ms(stage))
    }

    pub fn cache_hit(&self) -> bool {
        self.read(|m| m.cache_hit)
    }

    pub fn layer_used(&self) -> Option<CacheTier> {
        self.read(|m| m.cache_layer_used)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        self.read(serde_json::to_string)
    }
}

impl From<LatencyMetrics> for TraceHandle {
    fn from(metrics: LatencyMetrics) -> Self {
        Self(Arc::new(Mutex::new(metrics)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_hit_trace_headers() {
        let mut trace = LatencyMetrics::new(ObjectId::new("a1"));
        trace.record_db_lookup(Duration::from_micros(1250));

        let attempt = trace.start_layer(CacheTier::Memory);
        trace.end_layer(attempt, true, None, 10);
        trace.record_first_byte();
        trace.finalize();

        let headers = trace.headers();
        assert_eq!(headers["X-Cache-Hit"], "true");
        assert_eq!(headers["X-Cache-Layer-Used"], "MEMORY");
        assert_eq!(headers["X-Cache-MEMORY-Hit"], "true");
        assert_eq!(headers["X-Latency-DB-Lookup-Ms"], "1.25");
        assert_eq!(headers["X-Object-Size-Bytes"], "10");
        assert!(headers.contains_key("X-Latency-Cache-MEMORY-Ms"));
        assert!(!headers.contains_key("X-Latency-Backend-Ms"));
        assert!(trace.stage_ms("cache_MEMORY").is_some());
    }

    #[test]
    fn test_miss_trace_has_no_layer_used() {
        let mut trace = LatencyMetrics::new(ObjectId::new("b"));
        for tier in [CacheTier::Memory, CacheTier::FileSystem] {
            let attempt = trace.start_layer(tier);
            trace.end_layer(attempt, false, None, 0);
        }
        let attempt = trace.start_layer(CacheTier::Redis);
        let err = Error::unavailable(CacheTier::Redis, "connection refused");
        trace.end_layer(attempt, false, Some(&err), 0);

        trace.start_backend();
        trace.end_backend();
        trace.set_object_size(42);
        trace.finalize();

        let headers = trace.headers();
        assert_eq!(headers["X-Cache-Hit"], "false");
        assert!(!headers.contains_key("X-Cache-Layer-Used"));
        assert!(!headers.contains_key("X-Cache-MEMORY-Hit"));
        assert!(headers["X-Cache-REDIS-Error"].contains("connection refused"));
        assert!(headers.contains_key("X-Latency-Backend-Ms"));
        assert_eq!(headers["X-Object-Size-Bytes"], "42");
        assert_eq!(trace.layers.len(), 3);
        assert!(trace.attempt(CacheTier::Redis).unwrap().error.is_some());
    }

    #[test]
    fn test_first_byte_recorded_once() {
        let mut trace = LatencyMetrics::new(ObjectId::new("c"));
        trace.record_first_byte();
        let first = trace.stage_ms(STAGE_FIRST_BYTE).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        trace.record_first_byte();
        assert_eq!(trace.stage_ms(STAGE_FIRST_BYTE).unwrap(), first);
    }

    #[test]
    fn test_waterfall_is_sum_of_attempts() {
        let mut trace = LatencyMetrics::new(ObjectId::new("d"));
        for tier in CacheTier::lookup_order() {
            let attempt = trace.start_layer(*tier);
            std::thread::sleep(Duration::from_millis(1));
            trace.end_layer(attempt, false, None, 0);
        }
        trace.finalize();

        let sum: f64 = trace.layers.iter().map(|l| l.latency_ms).sum();
        let waterfall = trace.stage_ms(STAGE_CACHE_WATERFALL).unwrap();
        assert!((waterfall - sum).abs() < 1e-9);
        assert!(trace.stage_ms(STAGE_TOTAL).unwrap() >= waterfall);
    }

    #[test]
    fn test_handle_is_shared() {
        let handle = TraceHandle::new(ObjectId::new("e"));
        let clone = handle.clone();
        clone.update(|m| m.record_promotion(Duration::from_millis(3)));
        assert_eq!(handle.stage_ms(STAGE_PROMOTION), Some(3.0));
        assert!(handle.headers().contains_key("X-Latency-Promotion-Ms"));
        assert!(handle.to_json().unwrap().contains("\"object_id\":\"e\""));
    }
}
