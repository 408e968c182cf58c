//! Tiered Object Cache
//!
//! A multi-layer cache engine that answers object reads from the fastest
//! tier holding a copy and falls back to durable object storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Cache Orchestrator                                │
//! │        download • store • invalidate • preload • stats • health             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐                  │
//! │  │    Memory     │──►│  FileSystem   │──►│     Redis     │──┐               │
//! │  │  (≤ 8 MiB)    │   │  (≤ 32 MiB)   │   │  (≤ 100 MiB)  │  │               │
//! │  └───────────────┘   └───────────────┘   └───────────────┘  │               │
//! │          ▲  promotion of objects found further down          │               │
//! │          └───────────────────────────────────────────────────┤               │
//! │                                                              ▼               │
//! │                                              ┌───────────────────────────┐   │
//! │                                              │ Object Storage (S3/MinIO) │   │
//! │                                              │   authoritative, any size │   │
//! │                                              └───────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │   Latency trace headers   │   Prometheus registry   │   Cache event stream   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: tiers, the orchestrator, preload, latency tracing and metrics
//! - [`config`]: engine configuration and YAML loading
//! - [`error`]: error types and handling

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheEvent, CacheLayer, CacheLayerRef, CacheOrchestrator, CacheTier, Download, EngineStats,
    HealthReport, LatencyMetrics, LayerStats, ObjectId, ObjectStream, PreloadReport, SizeClass,
    TraceHandle,
};

pub use config::{BackendConfig, BackendKind, EngineConfig};

pub use error::{Error, Outcome, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
