//! Tiered Object Cache daemon
//!
//! Builds the cache engine from a YAML file plus environment overrides and
//! exposes its health, stats and Prometheus metrics over HTTP.
//!
//! ```text
//!   :8081  /healthz /livez /readyz          liveness and backend readiness
//!   :8080  /metrics /stats                  Prometheus text and JSON snapshot
//! ```

use anyhow::Context as _;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiered_object_cache::{BackendKind, CacheEvent, CacheOrchestrator, EngineConfig, ObjectId};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered Object Cache - memory, disk and Redis in front of object storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML engine configuration; missing sections use defaults
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Object storage backend (memory, s3, minio)
    #[arg(long, env = "CACHE_BACKEND")]
    backend: Option<BackendKind>,

    /// S3 bucket holding the objects
    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: Option<String>,

    /// S3-compatible endpoint, e.g. a MinIO URL
    #[arg(long, env = "S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, env = "S3_PREFIX")]
    s3_prefix: Option<String>,

    /// S3 region
    #[arg(long, env = "S3_REGION")]
    s3_region: Option<String>,

    /// Memory tier capacity in bytes
    #[arg(long, env = "MEMORY_CAPACITY_BYTES")]
    memory_capacity_bytes: Option<u64>,

    /// Largest object the memory tier holds
    #[arg(long, env = "MEMORY_MAX_OBJECT_BYTES")]
    memory_max_object_bytes: Option<u64>,

    /// Memory entry lifetime in seconds
    #[arg(long, env = "MEMORY_TTL_SECS")]
    memory_ttl_secs: Option<u64>,

    /// Memory TTL sweep interval in seconds
    #[arg(long, env = "MEMORY_SWEEP_SECS")]
    memory_sweep_secs: Option<u64>,

    /// Directory for the file system tier
    #[arg(long, env = "CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// File system tier capacity in bytes
    #[arg(long, env = "FS_CAPACITY_BYTES")]
    fs_capacity_bytes: Option<u64>,

    /// Largest object the file system tier holds
    #[arg(long, env = "FS_MAX_OBJECT_BYTES")]
    fs_max_object_bytes: Option<u64>,

    /// File entry lifetime in seconds
    #[arg(long, env = "FS_TTL_SECS")]
    fs_ttl_secs: Option<u64>,

    /// File TTL sweep interval in seconds
    #[arg(long, env = "FS_SWEEP_SECS")]
    fs_sweep_secs: Option<u64>,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Prefix for every Redis key the cache owns
    #[arg(long, env = "REDIS_KEY_PREFIX")]
    redis_key_prefix: Option<String>,

    /// Redis entry lifetime in seconds
    #[arg(long, env = "REDIS_TTL_SECS")]
    redis_ttl_secs: Option<u64>,

    /// Largest object the Redis tier holds
    #[arg(long, env = "REDIS_MAX_OBJECT_BYTES")]
    redis_max_object_bytes: Option<u64>,

    /// GETRANGE chunk size for streamed Redis reads
    #[arg(long, env = "REDIS_CHUNK_BYTES")]
    redis_chunk_bytes: Option<u64>,

    /// Per-command Redis timeout in milliseconds
    #[arg(long, env = "REDIS_TIMEOUT_MS")]
    redis_timeout_ms: Option<u64>,

    /// Run without the Redis tier
    #[arg(long, env = "DISABLE_REDIS")]
    disable_redis: bool,

    /// Maximum ids warmed concurrently by preload
    #[arg(long, env = "PRELOAD_CONCURRENCY")]
    preload_concurrency: Option<usize>,

    /// Object ids to warm into the cache at startup
    #[arg(long, env = "PRELOAD_IDS", value_delimiter = ',')]
    preload: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;

    info!("Starting Tiered Object Cache");
    info!("  Version: {}", tiered_object_cache::VERSION);
    info!("  Backend: {:?}", config.backend.kind);
    info!("  Memory tier: {}", config.memory.enabled);
    info!("  File system tier: {}", config.filesystem.enabled);
    info!("  Redis tier: {}", config.redis.enabled);
    if !config.backend.kind.is_durable() {
        warn!("Backend is process-local: stored objects are lost on restart; use --backend s3 in production");
    }

    let engine = Arc::new(
        CacheOrchestrator::connect(config)
            .await
            .context("failed to build cache engine")?,
    );

    let shutdown = CancellationToken::new();

    tokio::spawn(log_events(engine.clone(), shutdown.clone()));

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health = tokio::spawn(run_health_server(health_addr, engine.clone(), shutdown.clone()));

    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    let metrics = tokio::spawn(run_metrics_server(metrics_addr, engine.clone(), shutdown.clone()));

    if !args.preload.is_empty() {
        let ids = args.preload.iter().map(ObjectId::new).collect();
        let report = engine.preload(ids).await;
        info!("{}", report.summary());
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    shutdown.cancel();
    for (name, server) in [("health", health), ("metrics", metrics)] {
        match server.await {
            Ok(Err(e)) => error!(server = name, error = %e, "Server error"),
            Err(e) => error!(server = name, error = %e, "Server task failed"),
            Ok(Ok(())) => {}
        }
    }
    engine.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }
    if let Some(bucket) = &args.s3_bucket {
        config.backend.s3.bucket = bucket.clone();
    }
    if let Some(endpoint) = &args.s3_endpoint {
        config.backend.s3.endpoint_url = Some(endpoint.clone());
    }
    if let Some(prefix) = &args.s3_prefix {
        config.backend.s3.prefix = Some(prefix.clone());
    }
    if let Some(region) = &args.s3_region {
        config.backend.s3.region = Some(region.clone());
    }

    let memory = &mut config.memory;
    override_with(&mut memory.capacity_bytes, args.memory_capacity_bytes);
    override_with(&mut memory.max_object_size, args.memory_max_object_bytes);
    override_with(&mut memory.ttl_secs, args.memory_ttl_secs);
    override_with(&mut memory.sweep_interval_secs, args.memory_sweep_secs);

    let filesystem = &mut config.filesystem;
    override_with(&mut filesystem.root_path, args.cache_dir.clone());
    override_with(&mut filesystem.capacity_bytes, args.fs_capacity_bytes);
    override_with(&mut filesystem.max_object_size, args.fs_max_object_bytes);
    override_with(&mut filesystem.ttl_secs, args.fs_ttl_secs);
    override_with(&mut filesystem.sweep_interval_secs, args.fs_sweep_secs);

    let redis = &mut config.redis;
    override_with(&mut redis.url, args.redis_url.clone());
    override_with(&mut redis.key_prefix, args.redis_key_prefix.clone());
    override_with(&mut redis.ttl_secs, args.redis_ttl_secs);
    override_with(&mut redis.max_object_size, args.redis_max_object_bytes);
    override_with(&mut redis.chunk_bytes, args.redis_chunk_bytes);
    override_with(&mut redis.command_timeout_ms, args.redis_timeout_ms);
    if args.disable_redis {
        redis.enabled = false;
    }

    override_with(&mut config.preload.max_concurrent, args.preload_concurrency);

    config.validate()?;
    Ok(config)
}

/// Flags and env vars win over the file only when they are set
fn override_with<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

fn parse_addr(addr: &str, server: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid {} server address: {}", server, addr))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("redis=info".parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

async fn log_events(engine: Arc<CacheOrchestrator>, shutdown: CancellationToken) {
    let mut events = engine.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(CacheEvent::TierUnavailable { tier, reason }) => {
                warn!(%tier, %reason, "Tier unavailable")
            }
            Ok(event) => debug!(?event, "Cache event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging"),
            Err(RecvError::Closed) => return,
        }
    }
}

// =============================================================================
// HTTP Plumbing
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(body.into())
        .unwrap_or_else(|e| {
            error!(error = %e, "Failed to build response");
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("serialization failed: {}", e),
        ),
    }
}

fn not_found() -> Response<Body> {
    respond(StatusCode::NOT_FOUND, "text/plain", "not found")
}

async fn serve<F, Fut>(
    addr: SocketAddr,
    name: &'static str,
    engine: Arc<CacheOrchestrator>,
    shutdown: CancellationToken,
    route: F,
) -> anyhow::Result<()>
where
    F: Fn(Arc<CacheOrchestrator>, Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response<Body>> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let engine = engine.clone();
        let route = route.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = route(engine.clone(), req);
                async move { Ok::<_, Infallible>(response.await) }
            }))
        }
    });

    info!("{} server listening on {}", name, addr);
    Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {} server", name))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{} server error", name))
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(
    addr: SocketAddr,
    engine: Arc<CacheOrchestrator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    serve(addr, "Health", engine, shutdown, |engine, req| async move {
        match req.uri().path() {
            "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
            "/readyz" => {
                let report = engine.health().await;
                let status = if report.is_ready() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json(status, &report)
            }
            _ => not_found(),
        }
    })
    .await
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    engine: Arc<CacheOrchestrator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    serve(addr, "Metrics", engine, shutdown, |engine, req| async move {
        match req.uri().path() {
            "/metrics" => {
                // Refresh per-tier gauges before rendering
                engine.stats().await;
                match engine.metrics().encode() {
                    Ok((content_type, buffer)) => respond(StatusCode::OK, &content_type, buffer),
                    Err(e) => respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        e.to_string(),
                    ),
                }
            }
            "/stats" => json(StatusCode::OK, &engine.stats().await),
            _ => not_found(),
        }
    })
    .await
}
