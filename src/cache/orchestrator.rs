//! Cache Orchestrator
//!
//! Runs the waterfall lookup across the bounded tiers and the backend,
//! fans writes out by size eligibility, and promotes objects found below
//! the top tier.
//!
//! # Read path
//!
//! ```text
//! download(id)
//!   │
//!   ├─► MEMORY ──miss──► FILESYSTEM ──miss──► REDIS ──miss──► OBJECT_STORAGE
//!   │      │                  │                  │                  │
//!   │     hit                hit                hit            hit / NotFound
//!   │      └──────────────────┴────────┬─────────┴──────────────────┘
//!   │                                  ▼
//!   │                        DownloadStream (trace, tee)
//!   │                                  │ end of stream or drop
//!   │                                  ▼
//!   └──────────────────────── promotion task (TaskTracker)
//!                              writes into faster tiers that missed
//! ```
//!
//! Bounded-tier failures count as misses for the waterfall; they are logged,
//! metered and published as events. Only a backend failure or a confirmed
//! absence reaches the caller.

use crate::cache::entry::ObjectId;
use crate::cache::events::{CacheEvent, EvictionReason};
use crate::cache::latency::TraceHandle;
use crate::cache::metrics::{AggregateStats, EngineStats, RequestCounters};
use crate::cache::preload::{PreloadConfig, PreloadReport, Preloader};
use crate::cache::storage::{
    FileSystemCache, InMemoryObjectStore, MemoryCache, ObjectStorageBackend, ObjectStore,
    RedisCache, S3ObjectStore,
};
use crate::cache::sweeper::spawn_ttl_sweeper;
use crate::cache::telemetry::{EnhancedMetrics, RequestGuard};
use crate::cache::tier::CacheTier;
use crate::cache::{ByteStream, CacheLayer, CacheLayerRef, ObjectStream};
use crate::config::{BackendKind, EngineConfig};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Initial tee buffer reservation; larger objects grow it as chunks arrive
const TEE_INITIAL_CAPACITY: u64 = 8 * 1024 * 1024;

const DEFAULT_EVENT_BUFFER: usize = 1024;

// =============================================================================
// Engine Core (shared with streams and promotion tasks)
// =============================================================================

struct EngineCore {
    /// Bounded tiers, fastest first
    tiers: Vec<CacheLayerRef>,
    metrics: EnhancedMetrics,
    requests: RequestCounters,
    events: broadcast::Sender<CacheEvent>,
    promotions: TaskTracker,
}

impl EngineCore {
    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Log and meter a bounded-tier failure that the caller will never see
    fn absorb(&self, tier: CacheTier, operation: &str, id: &ObjectId, err: &Error) {
        warn!(%tier, operation, object_id = %id, error = %err, "Tier operation failed");
        self.metrics.record_error(tier);
        if err.is_tier_local() {
            self.emit(CacheEvent::TierUnavailable {
                tier,
                reason: err.to_string(),
            });
        }
    }
}

// =============================================================================
// Promotion
// =============================================================================

/// Where a served object came from and which faster tiers missed it
struct PromotionPlan {
    core: Arc<EngineCore>,
    id: ObjectId,
    source: CacheLayerRef,
    targets: Vec<CacheLayerRef>,
}

impl PromotionPlan {
    /// Fire and forget; `data` is `None` when the stream was abandoned and the
    /// bytes have to be read again from the source tier
    fn dispatch(self, data: Option<Bytes>, trace: TraceHandle) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(object_id = %self.id, "No runtime available, promotion skipped");
            return;
        };
        let tracker = self.core.promotions.clone();
        tracker.spawn_on(self.run(data, trace), &handle);
    }

    async fn run(self, data: Option<Bytes>, trace: TraceHandle) {
        let start = Instant::now();
        let from = self.source.tier();

        let data = match data {
            Some(data) => data,
            None => match self.source.get(&self.id).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!(object_id = %self.id, %from, "Source no longer holds object, promotion dropped");
                    return;
                }
                Err(e) => {
                    self.core.absorb(from, "promotion_read", &self.id, &e);
                    return;
                }
            },
        };
        let size = data.len() as u64;

        for target in &self.targets {
            let to = target.tier();
            // Re-running promotion on an object a tier already holds is a no-op
            if let Ok(true) = target.exists(&self.id).await {
                continue;
            }
            match target.store(&self.id, data.clone()).await {
                Ok(()) => {
                    self.core.requests.promotions.fetch_add(1, Ordering::Relaxed);
                    self.core.metrics.record_promotion(from, to);
                    self.core.emit(CacheEvent::promoted(&self.id, from, to, size));
                    debug!(object_id = %self.id, %from, %to, size_bytes = size, "Promoted");
                }
                Err(e) => {
                    self.core
                        .requests
                        .promotion_failures
                        .fetch_add(1, Ordering::Relaxed);
                    self.core.metrics.record_promotion_failure(to);
                    warn!(object_id = %self.id, %from, %to, error = %e, "Promotion failed");
                }
            }
        }

        trace.update(|m| m.record_promotion(start.elapsed()));
    }
}

// =============================================================================
// Download
// =============================================================================

/// A successful lookup: the body, where it came from, and its trace
pub struct Download {
    stream: DownloadStream,
    size: u64,
    served_by: CacheTier,
    trace: TraceHandle,
}

impl Download {
    /// Declared object size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True when a bounded tier served the object
    pub fn cache_hit(&self) -> bool {
        self.served_by.is_bounded()
    }

    /// Bounded tier that served the object; `None` when the backend did
    pub fn layer_used(&self) -> Option<CacheTier> {
        self.cache_hit().then_some(self.served_by)
    }

    pub fn served_by(&self) -> CacheTier {
        self.served_by
    }

    /// Shared trace; stays readable after the stream is consumed
    pub fn trace(&self) -> &TraceHandle {
        &self.trace
    }

    /// Current response headers for this request
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.trace.headers()
    }

    pub fn into_stream(self) -> DownloadStream {
        self.stream
    }

    /// Drain the body into one buffer
    pub async fn bytes(self) -> io::Result<Bytes> {
        self.stream.collect_bytes().await
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("size", &self.size)
            .field("served_by", &self.served_by)
            .finish()
    }
}

/// Response body that records stream timings and triggers promotion
pub struct DownloadStream {
    inner: ByteStream,
    size: u64,
    received: u64,
    trace: TraceHandle,
    core: Arc<EngineCore>,
    /// Copy of every chunk, kept only when there is somewhere to promote to
    tee: Option<BytesMut>,
    promotion: Option<PromotionPlan>,
    started: Instant,
    first_byte_seen: bool,
    finished: bool,
    _in_flight: RequestGuard,
}

impl DownloadStream {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drain the stream, checking it matches the declared size
    pub async fn collect_bytes(mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size.min(TEE_INITIAL_CAPACITY) as usize);
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        if buf.len() as u64 != self.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, read {}", self.size, buf.len()),
            ));
        }
        Ok(buf.freeze())
    }

    /// Close the trace once; promote only a body that arrived complete
    fn finish(&mut self, outcome: StreamEnd) {
        if self.finished {
            return;
        }
        self.finished = true;

        let elapsed = self.started.elapsed();
        self.trace.update(|m| {
            m.record_first_byte();
            m.end_stream();
            m.finalize();
        });
        self.core.metrics.observe_download(elapsed);

        let Some(plan) = self.promotion.take() else {
            return;
        };
        match outcome {
            StreamEnd::Complete if self.received == self.size => {
                let data = self.tee.take().map(BytesMut::freeze);
                plan.dispatch(data, self.trace.clone());
            }
            StreamEnd::Abandoned => plan.dispatch(None, self.trace.clone()),
            _ => debug!(object_id = %plan.id, "Incomplete body, promotion skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Complete,
    Failed,
    Abandoned,
}

impl Stream for DownloadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !this.first_byte_seen {
                    this.first_byte_seen = true;
                    this.trace.update(|m| m.record_first_byte());
                }
                this.received += chunk.len() as u64;
                if let Some(tee) = this.tee.as_mut() {
                    tee.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.tee = None;
                this.finish(StreamEnd::Failed);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(StreamEnd::Complete);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DownloadStream {
    fn drop(&mut self) {
        // Caller went away mid-stream
        self.finish(StreamEnd::Abandoned);
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TierHealth {
    pub tier: CacheTier,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reachability of every tier
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub tiers: Vec<TierHealth>,
}

impl HealthReport {
    /// The engine can serve requests as long as the backend is reachable
    pub fn is_ready(&self) -> bool {
        self.tiers
            .iter()
            .filter(|t| t.tier == CacheTier::ObjectStorage)
            .all(|t| t.healthy)
    }

    /// Some bounded tier is down; requests fall through to slower tiers
    pub fn is_degraded(&self) -> bool {
        self.tiers.iter().any(|t| !t.healthy)
    }
}

// =============================================================================
// Cache Orchestrator
// =============================================================================

/// The multi-tier cache engine
pub struct CacheOrchestrator {
    core: Arc<EngineCore>,
    backend: Arc<ObjectStorageBackend>,
    preloader: Preloader,
    cancel: CancellationToken,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheOrchestrator {
    /// Build an engine over pre-built tiers; they are ordered fastest first
    pub fn from_layers(tiers: Vec<CacheLayerRef>, backend: Arc<ObjectStorageBackend>) -> Result<Self> {
        Self::build(
            tiers,
            backend,
            PreloadConfig::default(),
            DEFAULT_EVENT_BUFFER,
            CancellationToken::new(),
        )
    }

    /// Build every enabled tier from config and start their TTL sweepers
    pub async fn with_config(config: EngineConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let mut tiers: Vec<CacheLayerRef> = Vec::new();
        let mut sweepers = Vec::new();

        if config.memory.enabled {
            let memory = Arc::new(MemoryCache::with_config(config.memory.clone()));
            sweepers.push(spawn_ttl_sweeper(
                memory.clone(),
                config.memory.sweep_interval(),
                cancel.child_token(),
            ));
            tiers.push(memory);
        }

        if config.filesystem.enabled {
            let filesystem = Arc::new(FileSystemCache::with_config(config.filesystem.clone()).await?);
            sweepers.push(spawn_ttl_sweeper(
                filesystem.clone(),
                config.filesystem.sweep_interval(),
                cancel.child_token(),
            ));
            tiers.push(filesystem);
        }

        if config.redis.enabled {
            tiers.push(Arc::new(RedisCache::with_config(config.redis.clone())?));
        }

        let backend = Arc::new(ObjectStorageBackend::new(store));
        let engine = Self::build(
            tiers,
            backend,
            config.preload.clone(),
            config.event_buffer,
            cancel,
        )?;
        *engine.sweepers.lock() = sweepers;
        Ok(engine)
    }

    /// Build the configured backend store, then the engine
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend.kind {
            BackendKind::Memory => Arc::new(InMemoryObjectStore::new()),
            BackendKind::S3 => Arc::new(S3ObjectStore::new(config.backend.s3.clone()).await),
        };
        Self::with_config(config, store).await
    }

    fn build(
        mut tiers: Vec<CacheLayerRef>,
        backend: Arc<ObjectStorageBackend>,
        preload: PreloadConfig,
        event_buffer: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        tiers.retain(|t| t.tier().is_bounded());
        tiers.sort_by_key(|t| t.tier().priority());

        let (events, _) = broadcast::channel(event_buffer.max(1));
        let core = Arc::new(EngineCore {
            tiers,
            metrics: EnhancedMetrics::new()?,
            requests: RequestCounters::default(),
            events,
            promotions: TaskTracker::new(),
        });

        info!(
            tiers = ?core.tiers.iter().map(|t| t.tier()).collect::<Vec<_>>(),
            backend = backend.store_name(),
            "Cache engine ready"
        );

        Ok(Self {
            core,
            backend,
            preloader: Preloader::with_config(preload),
            cancel,
            sweepers: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Bounded tiers in lookup order
    pub fn tiers(&self) -> &[CacheLayerRef] {
        &self.core.tiers
    }

    pub fn layer(&self, tier: CacheTier) -> Option<&CacheLayerRef> {
        self.core.tiers.iter().find(|t| t.tier() == tier)
    }

    pub fn backend(&self) -> &Arc<ObjectStorageBackend> {
        &self.backend
    }

    pub fn metrics(&self) -> &EnhancedMetrics {
        &self.core.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.core.events.subscribe()
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    pub async fn download(&self, id: &ObjectId) -> Result<Download> {
        self.download_with_trace(id, TraceHandle::new(id.clone())).await
    }

    /// Download into a trace the caller opened (and may already have written
    /// a DB lookup timing into)
    pub async fn download_with_trace(&self, id: &ObjectId, trace: TraceHandle) -> Result<Download> {
        let core = &self.core;
        let in_flight = core.metrics.request_guard();
        let mut missed: Vec<CacheLayerRef> = Vec::new();

        for tier in &core.tiers {
            let name = tier.tier();
            let attempt = trace.read(|m| m.start_layer(name));
            let start = Instant::now();
            let result = tier.get_stream(id).await;
            core.metrics.observe_layer_latency(name, "get", start.elapsed());

            match result {
                Ok(Some(stream)) => {
                    let size = stream.size();
                    trace.update(|m| m.end_layer(attempt, true, None, size));
                    core.metrics.record_hit(name, size);
                    core.requests.cache_hits.fetch_add(1, Ordering::Relaxed);
                    core.requests
                        .bytes_served_from_cache
                        .fetch_add(size, Ordering::Relaxed);
                    core.emit(CacheEvent::hit(id, name));
                    debug!(object_id = %id, tier = %name, size_bytes = size, "Cache hit");

                    let targets = Self::promotion_targets(missed, size);
                    return Ok(self.serve(id, tier.clone(), stream, targets, trace, in_flight));
                }
                Ok(None) => {
                    trace.update(|m| m.end_layer(attempt, false, None, 0));
                    core.metrics.record_miss(name);
                }
                Err(e) => {
                    trace.update(|m| m.end_layer(attempt, false, Some(&e), 0));
                    core.absorb(name, "get", id, &e);
                }
            }
            missed.push(tier.clone());
        }

        trace.update(|m| m.start_backend());
        let start = Instant::now();
        let result = self.backend.get_stream(id).await;
        core.metrics
            .observe_layer_latency(CacheTier::ObjectStorage, "get", start.elapsed());
        trace.update(|m| m.end_backend());

        match result {
            Ok(Some(stream)) => {
                let size = stream.size();
                trace.update(|m| m.set_object_size(size));
                core.metrics.record_hit(CacheTier::ObjectStorage, size);
                core.requests.cache_misses.fetch_add(1, Ordering::Relaxed);
                core.emit(CacheEvent::miss(id));
                debug!(object_id = %id, size_bytes = size, "Served from object storage");

                let targets = Self::promotion_targets(missed, size);
                let source: CacheLayerRef = self.backend.clone();
                Ok(self.serve(id, source, stream, targets, trace, in_flight))
            }
            Ok(None) => {
                core.requests.not_found.fetch_add(1, Ordering::Relaxed);
                core.metrics.record_miss(CacheTier::ObjectStorage);
                trace.update(|m| m.finalize());
                Err(Error::ObjectNotFound { id: id.to_string() })
            }
            Err(e) => {
                core.requests.backend_errors.fetch_add(1, Ordering::Relaxed);
                core.metrics.record_error(CacheTier::ObjectStorage);
                error!(object_id = %id, error = %e, "Object storage read failed");
                trace.update(|m| m.finalize());
                Err(e)
            }
        }
    }

    /// Faster tiers that missed and are allowed to hold an object of this size
    fn promotion_targets(missed: Vec<CacheLayerRef>, size: u64) -> Vec<CacheLayerRef> {
        missed.into_iter().filter(|t| t.accepts(size)).collect()
    }

    fn serve(
        &self,
        id: &ObjectId,
        source: CacheLayerRef,
        stream: ObjectStream,
        targets: Vec<CacheLayerRef>,
        trace: TraceHandle,
        in_flight: RequestGuard,
    ) -> Download {
        let size = stream.size();
        let served_by = source.tier();
        trace.update(|m| m.start_stream());

        let (tee, promotion) = if targets.is_empty() {
            (None, None)
        } else {
            (
                Some(BytesMut::with_capacity(size.min(TEE_INITIAL_CAPACITY) as usize)),
                Some(PromotionPlan {
                    core: self.core.clone(),
                    id: id.clone(),
                    source,
                    targets,
                }),
            )
        };

        Download {
            stream: DownloadStream {
                inner: stream.into_body(),
                size,
                received: 0,
                trace: trace.clone(),
                core: self.core.clone(),
                tee,
                promotion,
                started: Instant::now(),
                first_byte_seen: false,
                finished: false,
                _in_flight: in_flight,
            },
            size,
            served_by,
            trace,
        }
    }

    /// Wait for every promotion dispatched so far
    pub async fn flush_promotions(&self) {
        let tracker = &self.core.promotions;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Write to object storage, then to every size-eligible bounded tier
    ///
    /// Returns the tiers that accepted the object, backend first. Only a
    /// backend failure is an error.
    pub async fn store(&self, id: &ObjectId, data: Bytes) -> Result<Vec<CacheTier>> {
        let core = &self.core;
        let size = data.len() as u64;

        let start = Instant::now();
        self.backend.store(id, data.clone()).await.map_err(|e| {
            error!(object_id = %id, error = %e, "Object storage write failed");
            core.metrics.record_store_failure(CacheTier::ObjectStorage, e.reason_label());
            e
        })?;
        core.metrics
            .observe_layer_latency(CacheTier::ObjectStorage, "store", start.elapsed());

        let mut stored = vec![CacheTier::ObjectStorage];
        for tier in &core.tiers {
            let name = tier.tier();
            if !tier.accepts(size) {
                continue;
            }
            let start = Instant::now();
            match tier.store(id, data.clone()).await {
                Ok(()) => {
                    core.metrics.observe_layer_latency(name, "store", start.elapsed());
                    stored.push(name);
                }
                Err(e) => {
                    core.metrics.record_store_failure(name, e.reason_label());
                    core.absorb(name, "store", id, &e);
                }
            }
        }

        debug!(object_id = %id, size_bytes = size, tiers = ?stored, "Stored");
        core.emit(CacheEvent::Stored {
            id: id.to_string(),
            size_bytes: size,
            tiers: stored.clone(),
        });
        Ok(stored)
    }

    /// Remove an object from every tier, object storage included
    pub async fn invalidate(&self, id: &ObjectId) -> Result<()> {
        self.remove_cached(id).await;
        self.backend.delete(id).await.map_err(|e| {
            error!(object_id = %id, error = %e, "Object storage delete failed");
            e
        })?;

        info!(object_id = %id, "Invalidated");
        self.core.emit(CacheEvent::Invalidated {
            id: id.to_string(),
            include_backend: true,
        });
        Ok(())
    }

    /// Remove an object from the bounded tiers only; the durable copy stays
    pub async fn evict_cached(&self, id: &ObjectId) {
        self.remove_cached(id).await;
        debug!(object_id = %id, "Evicted from cache tiers");
        self.core.emit(CacheEvent::Invalidated {
            id: id.to_string(),
            include_backend: false,
        });
    }

    async fn remove_cached(&self, id: &ObjectId) {
        for tier in &self.core.tiers {
            let name = tier.tier();
            let held = tier.exists(id).await.unwrap_or(false);
            match tier.delete(id).await {
                Ok(()) if held => self.core.metrics.record_removal(name, EvictionReason::Manual, 1),
                Ok(()) => {}
                Err(e) => self.core.absorb(name, "delete", id, &e),
            }
        }
    }

    /// Warm the bounded tiers with a batch of ids
    pub async fn preload(&self, ids: Vec<ObjectId>) -> PreloadReport {
        let report = self
            .preloader
            .run(ids, &self.core.tiers, &self.backend, &self.core.metrics)
            .await;
        self.core.emit(CacheEvent::PreloadComplete {
            requested: report.requested(),
            succeeded: report.succeeded().len(),
            failed: report.failed().len(),
            bytes_loaded: report.bytes_loaded(),
        });
        report
    }

    /// Flush every bounded tier; object storage is untouched
    ///
    /// Returns the tiers that were cleared. A tier that fails to clear is
    /// logged and left out.
    pub async fn clear_all(&self) -> Vec<CacheTier> {
        let mut cleared = Vec::new();
        for tier in &self.core.tiers {
            let name = tier.tier();
            match tier.clear().await {
                Ok(()) => {
                    cleared.push(name);
                    self.core.emit(CacheEvent::TierCleared { tier: name });
                }
                Err(e) => {
                    warn!(tier = %name, error = %e, "Clear failed");
                    self.core.metrics.record_error(name);
                }
            }
        }
        info!(tiers = ?cleared, "Cache tiers cleared");
        cleared
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Per-layer stats plus the aggregate; refreshes the layer gauges
    pub async fn stats(&self) -> EngineStats {
        let mut layers = Vec::with_capacity(self.core.tiers.len() + 1);
        for tier in &self.core.tiers {
            layers.push(tier.stats().await);
        }
        layers.push(self.backend.stats().await);

        for layer in &layers {
            self.core.metrics.observe_layer(layer);
        }

        let requests = self.core.requests.snapshot();
        EngineStats {
            aggregate: AggregateStats::from_layers(&layers, &requests),
            layers,
            requests,
            preload: self.preloader.stats(),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let mut tiers = Vec::with_capacity(self.core.tiers.len() + 1);
        let layers = self
            .core
            .tiers
            .iter()
            .map(|t| &**t)
            .chain(std::iter::once(&*self.backend as &dyn CacheLayer));
        for layer in layers {
            let (healthy, error) = match layer.health_check().await {
                Ok(healthy) => (healthy, None),
                Err(e) => (false, Some(e.to_string())),
            };
            tiers.push(TierHealth {
                tier: layer.tier(),
                healthy,
                error,
            });
        }
        HealthReport { tiers }
    }

    /// Stop the sweepers and wait for in-flight promotions
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sweepers = std::mem::take(&mut *self.sweepers.lock());
        for handle in sweepers {
            if let Err(e) = handle.await {
                warn!(error = %e, "TTL sweeper ended abnormally");
            }
        }
        self.core.promotions.close();
        self.core.promotions.wait().await;
        info!("Cache engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::LayerStats;
    use crate::cache::metrics::LayerCounters;
    use crate::cache::storage::{FileSystemCacheConfig, MemoryCacheConfig};
    use crate::error::Outcome;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use tempfile::TempDir;

    // =========================================================================
    // Scripted remote tier
    // =========================================================================

    /// In-process stand-in for the Redis tier that can be switched offline
    #[derive(Default)]
    struct ScriptedRemote {
        objects: DashMap<ObjectId, Bytes>,
        offline: AtomicBool,
        stream_calls: AtomicU64,
        counters: LayerCounters,
    }

    impl ScriptedRemote {
        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                self.counters.record_error();
                return Err(Error::unavailable(CacheTier::Redis, "connection refused"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheLayer for ScriptedRemote {
        fn tier(&self) -> CacheTier {
            CacheTier::Redis
        }

        fn max_object_size(&self) -> u64 {
            1024 * 1024
        }

        async fn store(&self, id: &ObjectId, data: Bytes) -> Result<()> {
            self.check()?;
            self.objects.insert(id.clone(), data);
            Ok(())
        }

        async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>> {
            self.check()?;
            let data = self.objects.get(id).map(|v| v.value().clone());
            match &data {
                Some(_) => self.counters.record_hit(),
                None => self.counters.record_miss(),
            }
            Ok(data)
        }

        async fn get_stream(&self, id: &ObjectId) -> Result<Option<ObjectStream>> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .get(id)
                .await?
                .map(|data| ObjectStream::from_bytes(data, 4)))
        }

        async fn exists(&self, id: &ObjectId) -> Result<bool> {
            self.check()?;
            Ok(self.objects.contains_key(id))
        }

        async fn delete(&self, id: &ObjectId) -> Result<()> {
            self.check()?;
            self.objects.remove(id);
            Ok(())
        }

        async fn clear(&self) -> Result<()> {
            self.check()?;
            self.objects.clear();
            self.counters.reset();
            Ok(())
        }

        async fn stats(&self) -> LayerStats {
            let bytes = self.objects.iter().map(|v| v.len() as u64).sum();
            self.counters
                .layer_stats(CacheTier::Redis, self.objects.len() as u64, bytes, None)
        }

        async fn health_check(&self) -> Result<bool> {
            self.check()?;
            Ok(true)
        }
    }

    // =========================================================================
    // Fixture
    // =========================================================================

    struct Fixture {
        engine: CacheOrchestrator,
        memory: Arc<MemoryCache>,
        filesystem: Arc<FileSystemCache>,
        remote: Arc<ScriptedRemote>,
        store: Arc<InMemoryObjectStore>,
        _dir: TempDir,
    }

    async fn fixture_with(memory_capacity: u64, memory_max_object: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryCache::with_config(MemoryCacheConfig {
            capacity_bytes: memory_capacity,
            max_object_size: memory_max_object,
            ..Default::default()
        }));
        let filesystem = Arc::new(
            FileSystemCache::with_config(FileSystemCacheConfig {
                root_path: dir.path().to_path_buf(),
                capacity_bytes: 1024 * 1024,
                max_object_size: 64 * 1024,
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let remote = Arc::new(ScriptedRemote::default());
        let (backend, store) = ObjectStorageBackend::in_memory();

        // Deliberately out of order; the engine sorts by tier speed
        let tiers: Vec<CacheLayerRef> = vec![remote.clone(), memory.clone(), filesystem.clone()];
        let engine = CacheOrchestrator::from_layers(tiers, Arc::new(backend)).unwrap();

        Fixture {
            engine,
            memory,
            filesystem,
            remote,
            store,
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(1024 * 1024, 8 * 1024).await
    }

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    #[tokio::test]
    async fn test_small_object_served_from_memory_then_invalidated() {
        let fx = fixture().await;
        let a1 = id("a1");

        let tiers = fx.engine.store(&a1, Bytes::from_static(b"0123456789")).await.unwrap();
        assert_eq!(
            tiers,
            vec![
                CacheTier::ObjectStorage,
                CacheTier::Memory,
                CacheTier::FileSystem,
                CacheTier::Redis
            ]
        );

        let download = fx.engine.download(&a1).await.unwrap();
        assert!(download.cache_hit());
        assert_eq!(download.layer_used(), Some(CacheTier::Memory));
        assert_eq!(download.size(), 10);
        let trace = download.trace().clone();
        assert_eq!(download.bytes().await.unwrap(), Bytes::from_static(b"0123456789"));

        let headers = trace.headers();
        assert_eq!(headers["X-Cache-Hit"], "true");
        assert_eq!(headers["X-Cache-Layer-Used"], "MEMORY");
        assert!(headers.contains_key("X-Latency-First-Byte-Ms"));
        assert!(!headers.contains_key("X-Latency-Backend-Ms"));

        fx.engine.invalidate(&a1).await.unwrap();
        let err = fx.engine.download(&a1).await.unwrap_err();
        assert_matches!(err, Error::ObjectNotFound { .. });
        assert_eq!(err.outcome(), Outcome::NotFound);
        assert!(!fx.memory.exists(&a1).await.unwrap());
        assert!(!fx.remote.exists(&a1).await.unwrap());
    }

    #[tokio::test]
    async fn test_evicted_object_falls_through_to_backend() {
        let fx = fixture().await;
        let a1 = id("a1");
        fx.engine.store(&a1, Bytes::from_static(b"0123456789")).await.unwrap();

        fx.engine.evict_cached(&a1).await;
        let download = fx.engine.download(&a1).await.unwrap();
        assert!(!download.cache_hit());
        assert_eq!(download.layer_used(), None);
        assert_eq!(download.served_by(), CacheTier::ObjectStorage);
        assert!(!download.headers().contains_key("X-Cache-Layer-Used"));
        assert_eq!(download.bytes().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_waterfall_stops_at_remote_tier() {
        let fx = fixture().await;
        let obj = id("only-remote");
        fx.remote.store(&obj, Bytes::from_static(b"remote bytes")).await.unwrap();

        let download = fx.engine.download(&obj).await.unwrap();
        assert_eq!(download.layer_used(), Some(CacheTier::Redis));
        let trace = download.trace().clone();
        assert_eq!(download.bytes().await.unwrap(), Bytes::from_static(b"remote bytes"));

        trace.read(|m| {
            assert!(!m.attempt(CacheTier::Memory).unwrap().hit);
            assert!(!m.attempt(CacheTier::FileSystem).unwrap().hit);
            assert!(m.attempt(CacheTier::Redis).unwrap().hit);
            assert!(m.stage_ms("backend").is_none());
        });
        assert_eq!(fx.store.reads(), 0);
    }

    #[tokio::test]
    async fn test_promotion_converges_without_double_counting() {
        let fx = fixture().await;
        let obj = id("warm-me");
        let data = Bytes::from(vec![7u8; 100]);
        fx.remote.store(&obj, data.clone()).await.unwrap();

        for _ in 0..3 {
            let download = fx.engine.download(&obj).await.unwrap();
            assert_eq!(download.bytes().await.unwrap(), data);
            fx.engine.flush_promotions().await;
        }

        assert!(fx.memory.exists(&obj).await.unwrap());
        assert!(fx.filesystem.exists(&obj).await.unwrap());
        assert_eq!(fx.memory.entry_count(), 1);
        assert_eq!(fx.memory.size_bytes(), 100);
        assert_eq!(fx.filesystem.size_bytes(), 100);

        let stats = fx.engine.stats().await;
        assert_eq!(stats.requests.promotions, 2);
        assert_eq!(stats.requests.cache_hits, 3);

        let download = fx.engine.download(&obj).await.unwrap();
        assert_eq!(download.layer_used(), Some(CacheTier::Memory));
    }

    #[tokio::test]
    async fn test_promotion_records_trace_latency() {
        let fx = fixture().await;
        let obj = id("traced");
        fx.remote.store(&obj, Bytes::from_static(b"abc")).await.unwrap();

        let download = fx.engine.download(&obj).await.unwrap();
        let trace = download.trace().clone();
        download.bytes().await.unwrap();
        fx.engine.flush_promotions().await;

        assert!(trace.headers().contains_key("X-Latency-Promotion-Ms"));
    }

    #[tokio::test]
    async fn test_abandoned_stream_still_promotes() {
        let fx = fixture().await;
        let obj = id("abandoned");
        fx.remote.store(&obj, Bytes::from(vec![1u8; 64])).await.unwrap();

        let mut stream = fx.engine.download(&obj).await.unwrap().into_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        drop(stream);

        fx.engine.flush_promotions().await;
        assert_eq!(fx.memory.get(&obj).await.unwrap().unwrap().len(), 64);
        assert_eq!(fx.engine.metrics().concurrent_requests(), 0);
    }

    #[tokio::test]
    async fn test_backend_hit_promotes_into_eligible_tiers_only() {
        // Memory accepts at most 16 bytes
        let fx = fixture_with(1024, 16).await;
        let obj = id("mid");
        fx.store.put(obj.as_str(), Bytes::from(vec![3u8; 32])).await.unwrap();

        let download = fx.engine.download(&obj).await.unwrap();
        assert_eq!(download.served_by(), CacheTier::ObjectStorage);
        download.bytes().await.unwrap();
        fx.engine.flush_promotions().await;

        assert!(!fx.memory.exists(&obj).await.unwrap());
        assert!(fx.filesystem.exists(&obj).await.unwrap());
        assert!(fx.remote.exists(&obj).await.unwrap());

        let download = fx.engine.download(&obj).await.unwrap();
        assert_eq!(download.layer_used(), Some(CacheTier::FileSystem));
    }

    #[tokio::test]
    async fn test_oversized_object_is_served_from_backend_every_time() {
        let fx = fixture().await;
        let big = id("big");
        let data = Bytes::from(vec![9u8; 2 * 1024 * 1024]);

        let tiers = fx.engine.store(&big, data.clone()).await.unwrap();
        assert_eq!(tiers, vec![CacheTier::ObjectStorage]);

        for _ in 0..2 {
            let download = fx.engine.download(&big).await.unwrap();
            assert_eq!(download.served_by(), CacheTier::ObjectStorage);
            assert_eq!(download.bytes().await.unwrap(), data);
            fx.engine.flush_promotions().await;
        }
        assert_eq!(fx.memory.entry_count(), 0);
        assert!(!fx.remote.exists(&big).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_remote_tier_is_absorbed() {
        let fx = fixture().await;
        let mut events = fx.engine.subscribe();
        let obj = id("resilient");
        fx.remote.set_offline(true);

        let tiers = fx.engine.store(&obj, Bytes::from_static(b"data")).await.unwrap();
        assert!(!tiers.contains(&CacheTier::Redis));

        fx.engine.evict_cached(&obj).await;
        let download = fx.engine.download(&obj).await.unwrap();
        assert_eq!(download.served_by(), CacheTier::ObjectStorage);
        assert!(download.headers()["X-Cache-REDIS-Error"].contains("connection refused"));
        assert_eq!(download.bytes().await.unwrap(), Bytes::from_static(b"data"));

        let mut saw_unavailable = false;
        while let Ok(event) = events.try_recv() {
            saw_unavailable |= event.is_error();
        }
        assert!(saw_unavailable);

        let stats = fx.engine.stats().await;
        let redis = stats.layer(CacheTier::Redis).unwrap();
        assert!(redis.errors >= 1);
        assert_eq!(redis.lookups(), 0);

        let health = fx.engine.health().await;
        assert!(health.is_ready());
        assert!(health.is_degraded());
    }

    #[tokio::test]
    async fn test_backend_failure_is_terminal() {
        let fx = fixture().await;
        let obj = id("broken");
        fx.store.fail_key("broken");

        let err = fx.engine.download(&obj).await.unwrap_err();
        assert_matches!(err, Error::Backend { .. });
        assert_eq!(err.outcome(), Outcome::Internal);

        let err = fx.engine.store(&obj, Bytes::from_static(b"x")).await.unwrap_err();
        assert_matches!(err, Error::Backend { .. });
        assert!(!fx.memory.exists(&obj).await.unwrap());
    }

    #[tokio::test]
    async fn test_preload_reports_partial_failure() {
        let fx = fixture().await;
        for key in ["A", "B", "C"] {
            fx.store.put(key, Bytes::from_static(b"payload")).await.unwrap();
        }
        fx.store.fail_key("B");
        let mut events = fx.engine.subscribe();

        let report = fx
            .engine
            .preload(vec![id("A"), id("B"), id("C")])
            .await;
        assert_eq!(report.succeeded(), vec![&id("A"), &id("C")]);
        assert_eq!(report.failed().len(), 1);
        assert!(fx.memory.exists(&id("A")).await.unwrap());
        assert!(fx.remote.exists(&id("C")).await.unwrap());

        let event = events.recv().await.unwrap();
        assert_matches!(event, CacheEvent::PreloadComplete { requested: 3, succeeded: 2, failed: 1, .. });

        let download = fx.engine.download(&id("C")).await.unwrap();
        assert_eq!(download.layer_used(), Some(CacheTier::Memory));
    }

    #[tokio::test]
    async fn test_stats_aggregate() {
        let fx = fixture().await;
        fx.engine.store(&id("x"), Bytes::from(vec![0u8; 10])).await.unwrap();
        fx.engine.store(&id("y"), Bytes::from(vec![0u8; 20])).await.unwrap();
        fx.engine.evict_cached(&id("y")).await;

        fx.engine.download(&id("x")).await.unwrap().bytes().await.unwrap();
        fx.engine.download(&id("y")).await.unwrap().bytes().await.unwrap();
        fx.engine.flush_promotions().await;

        let stats = fx.engine.stats().await;
        assert_eq!(stats.aggregate.hits, 1);
        assert_eq!(stats.aggregate.misses, 1);
        assert!((stats.aggregate.hit_rate - 0.5).abs() < 1e-9);
        // x and y in each of the three bounded tiers
        assert_eq!(stats.aggregate.total_objects, 6);
        assert_eq!(stats.aggregate.total_size_bytes, 90);
        assert_eq!(stats.layers.len(), 4);

        let memory = stats.layer(CacheTier::Memory).unwrap();
        assert_eq!(memory.hits, 1);
        assert!(memory.capacity_bytes.is_some());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_backend() {
        let fx = fixture().await;
        let obj = id("kept");
        fx.engine.store(&obj, Bytes::from_static(b"durable")).await.unwrap();

        let cleared = fx.engine.clear_all().await;
        assert_eq!(cleared.len(), 3);
        assert_eq!(fx.memory.entry_count(), 0);

        let download = fx.engine.download(&obj).await.unwrap();
        assert_eq!(download.served_by(), CacheTier::ObjectStorage);
        assert_eq!(download.bytes().await.unwrap(), Bytes::from_static(b"durable"));
    }

    #[tokio::test]
    async fn test_db_lookup_timing_is_carried_into_headers() {
        let fx = fixture().await;
        let obj = id("with-db");
        fx.engine.store(&obj, Bytes::from_static(b"z")).await.unwrap();

        let trace = TraceHandle::new(obj.clone());
        trace.update(|m| m.record_db_lookup(std::time::Duration::from_millis(2)));
        let download = fx.engine.download_with_trace(&obj, trace.clone()).await.unwrap();
        download.bytes().await.unwrap();

        let headers = trace.headers();
        assert_eq!(headers["X-Latency-DB-Lookup-Ms"], "2.00");
        assert!(headers.contains_key("X-Latency-Stream-Ms"));
        assert!(headers.contains_key("X-Latency-Cache-Waterfall-Ms"));
    }

    #[tokio::test]
    async fn test_round_trip_across_sizes() {
        let fx = fixture().await;
        for (name, len) in [("s0", 0usize), ("s1", 1), ("s2", 5000), ("s3", 20_000), ("s4", 300_000)] {
            let data = Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>());
            fx.engine.store(&id(name), data.clone()).await.unwrap();
            let download = fx.engine.download(&id(name)).await.unwrap();
            assert_eq!(download.bytes().await.unwrap(), data, "object {}", name);
        }
    }

    #[tokio::test]
    async fn test_config_built_engine_with_sweepers() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.memory.capacity_bytes = 1024 * 1024;
        config.memory.max_object_size = 1024;
        config.filesystem.root_path = dir.path().to_path_buf();
        config.filesystem.capacity_bytes = 1024 * 1024;
        config.filesystem.max_object_size = 1024;
        config.redis.enabled = false;

        let engine = CacheOrchestrator::with_config(config, Arc::new(InMemoryObjectStore::new()))
            .await
            .unwrap();
        assert_eq!(engine.tiers().len(), 2);
        assert!(engine.layer(CacheTier::Redis).is_none());

        engine.store(&id("k"), Bytes::from_static(b"v")).await.unwrap();
        let download = engine.download(&id("k")).await.unwrap();
        assert_eq!(download.layer_used(), Some(CacheTier::Memory));
        download.bytes().await.unwrap();

        engine.shutdown().await;
    }
}
