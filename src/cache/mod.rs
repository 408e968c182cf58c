//! Multi-Layer Object Cache
//!
//! A tiered lookup/storage engine that serves every object from the fastest
//! tier holding it:
//! - **Memory**: in-process, LRU-evicted, TTL-swept
//! - **FileSystem**: local disk, same policy, atomic temp-file writes
//! - **Redis**: shared remote tier with native TTL and chunked streaming
//! - **ObjectStorage**: durable, authoritative, never evicts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Orchestrator                              │
//! │   download ─► waterfall ─► stream + trace ─► fire-and-forget promotion   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐ │
//! │  │    Memory    │─►│  FileSystem  │─►│    Redis     │─►│ObjectStorage │ │
//! │  │  (DashMap)   │  │ (local disk) │  │ (SET EX /    │  │ (S3 / MinIO) │ │
//! │  │  ≤8 MiB      │  │  ≤32 MiB     │  │  GETRANGE)   │  │  any size    │ │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────┘  └──────────────┘ │
//! │         └──────────┬──────┘                                              │
//! │            ┌───────┴────────┐   ┌────────────────┐                       │
//! │            │  LRU Tracker   │   │  TTL Sweepers  │                       │
//! │            │  (64-sharded)  │   │  (one per tier)│                       │
//! │            └────────────────┘   └────────────────┘                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Latency trace per request  •  Prometheus metrics  •  Cache events       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tiered_object_cache::cache::{CacheOrchestrator, ObjectId};
//! use tiered_object_cache::config::EngineConfig;
//! use bytes::Bytes;
//!
//! let engine = CacheOrchestrator::with_config(EngineConfig::default(), backend).await?;
//!
//! let id = ObjectId::new("a1");
//! engine.store(&id, Bytes::from_static(b"0123456789")).await?;
//!
//! let download = engine.download(&id).await?;
//! assert_eq!(download.layer_used(), Some(CacheTier::Memory));
//! let bytes = download.into_stream().collect_bytes().await?;
//! ```

pub mod capacity;
pub mod entry;
pub mod events;
pub mod latency;
pub mod lru;
pub mod metrics;
pub mod orchestrator;
pub mod preload;
pub mod storage;
pub mod sweeper;
pub mod telemetry;
pub mod tier;

// Re-export main types
pub use entry::{CacheEntry, LayerStats, ObjectId};
pub use events::{CacheEvent, EvictionReason};
pub use latency::{LatencyMetrics, LayerAttempt, TraceHandle};
pub use lru::{EvictionCandidate, ShardedLruTracker};
pub use metrics::{AggregateStats, EngineStats, LayerCounters};
pub use orchestrator::{CacheOrchestrator, Download, HealthReport};
pub use preload::{PreloadOutcome, PreloadReport, PreloadStatsSnapshot};
pub use storage::{
    FileSystemCache, InMemoryObjectStore, MemoryCache, ObjectStorageBackend, ObjectStore,
    RedisCache, S3ObjectStore,
};
pub use sweeper::{spawn_ttl_sweeper, Expiring};
pub use telemetry::EnhancedMetrics;
pub use tier::{CacheTier, SizeClass};

use crate::error::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

// =============================================================================
// Object Stream
// =============================================================================

/// Lazy, single-pass byte sequence
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A readable object body plus its declared size
pub struct ObjectStream {
    size: u64,
    body: ByteStream,
}

impl ObjectStream {
    pub fn new(size: u64, body: ByteStream) -> Self {
        Self { size, body }
    }

    /// Serve an in-memory buffer as a stream of `chunk_size` slices
    pub fn from_bytes(data: Bytes, chunk_size: usize) -> Self {
        let size = data.len() as u64;
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
            .collect();
        Self::new(size, stream::iter(chunks).boxed())
    }

    /// Declared size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_body(self) -> ByteStream {
        self.body
    }

    /// Drain the stream into one buffer, checking it matches the declared size
    pub async fn collect_bytes(mut self) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size as usize);
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        if buf.len() as u64 != self.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, read {}", self.size, buf.len()),
            ));
        }
        Ok(buf.freeze())
    }
}

impl Stream for ObjectStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.body.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStream").field("size", &self.size).finish()
    }
}

// =============================================================================
// CacheLayer Trait
// =============================================================================

/// The capability set every tier implements
///
/// A tier miss is `Ok(None)` / `Ok(false)`, never an error. I/O failures are
/// `Error::TierUnavailable`; a bounded tier that cannot make room returns
/// `Error::CapacityExceeded`.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Get the tier this layer serves
    fn tier(&self) -> CacheTier;

    /// Largest object this tier is willing to hold
    fn max_object_size(&self) -> u64 {
        u64::MAX
    }

    /// Size-class eligibility: objects up to the threshold may live here
    fn accepts(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_object_size()
    }

    /// Store an object; either the full entry becomes visible or nothing does
    async fn store(&self, id: &ObjectId, data: Bytes) -> Result<()>;

    /// Read the full object, updating recency and hit/miss counters
    async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>>;

    /// Open the object as a stream; same counter side effects as `get`
    async fn get_stream(&self, id: &ObjectId) -> Result<Option<ObjectStream>>;

    /// Membership check without counter side effects
    async fn exists(&self, id: &ObjectId) -> Result<bool>;

    /// Remove an object; deleting an absent id is not an error
    async fn delete(&self, id: &ObjectId) -> Result<()>;

    /// Drop every entry and reset counters
    async fn clear(&self) -> Result<()>;

    /// Point-in-time stats
    async fn stats(&self) -> LayerStats;

    /// Check if the tier is reachable
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Type alias for a shared tier handle
pub type CacheLayerRef = Arc<dyn CacheLayer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_from_bytes_chunks() {
        let data = Bytes::from_static(b"0123456789");
        let mut stream = ObjectStream::from_bytes(data.clone(), 4);
        assert_eq!(stream.size(), 10);

        let mut lens = Vec::new();
        while let Some(chunk) = stream.next().await {
            lens.push(chunk.unwrap().len());
        }
        assert_eq!(lens, vec![4, 4, 2]);

        let collected = ObjectStream::from_bytes(data.clone(), 3)
            .collect_bytes()
            .await
            .unwrap();
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn test_collect_detects_short_body() {
        let body = stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed();
        let err = ObjectStream::new(5, body).collect_bytes().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_empty_object_stream() {
        let stream = ObjectStream::from_bytes(Bytes::new(), 4);
        assert_eq!(stream.size(), 0);
        assert!(stream.collect_bytes().await.unwrap().is_empty());
    }
}
