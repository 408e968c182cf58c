//! Object Storage Backend
//!
//! The authoritative tier. The engine only needs a get/put-by-key contract
//! ([`ObjectStore`]); [`ObjectStorageBackend`] adapts any store to the
//! [`CacheLayer`] capability set so it can sit at the end of the waterfall.

use crate::cache::entry::{LayerStats, ObjectId};
use crate::cache::metrics::LayerCounters;
use crate::cache::tier::CacheTier;
use crate::cache::{CacheLayer, ObjectStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::Client;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

// =============================================================================
// ObjectStore Trait
// =============================================================================

/// Minimal durable key/value contract
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Open an object as a stream; defaults to buffering `get`
    async fn get_stream(&self, key: &str) -> Result<Option<ObjectStream>> {
        Ok(self
            .get(key)
            .await?
            .map(|data| ObjectStream::from_bytes(data, 1024 * 1024)))
    }

    /// Object size, or `None` when absent
    async fn head(&self, key: &str) -> Result<Option<u64>>;

    /// Remove an object; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// `(objects, bytes)` when the store can report it cheaply
    async fn usage(&self) -> Option<(u64, u64)> {
        None
    }
}

// =============================================================================
// In-Memory Object Store
// =============================================================================

/// Process-local store for tests and single-node runs
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Bytes>,
    failing: DashSet<String>,
    reads: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `key` fail until [`Self::heal`] is called
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing.insert(key.into());
    }

    pub fn heal(&self, key: &str) {
        self.failing.remove(key);
    }

    /// Number of get/get_stream/head calls served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn check(&self, operation: &str, key: &str) -> Result<()> {
        if self.failing.contains(key) {
            return Err(Error::backend(operation, format!("injected failure for {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check("put", key)?;
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.check("get", key)?;
        Ok(self.objects.get(key).map(|v| v.value().clone()))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.check("head", key)?;
        Ok(self.objects.get(key).map(|v| v.len() as u64))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check("delete", key)?;
        self.objects.remove(key);
        Ok(())
    }

    async fn usage(&self) -> Option<(u64, u64)> {
        let bytes = self.objects.iter().map(|v| v.len() as u64).sum();
        Some((self.objects.len() as u64, bytes))
    }
}

// =============================================================================
// S3 Object Store
// =============================================================================

/// Configuration for an S3-compatible store (AWS, MinIO, LocalStack)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    /// Optional key prefix within the bucket
    pub prefix: Option<String>,
    /// Custom endpoint URL (MinIO and friends)
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    /// MinIO needs path-style addressing
    pub force_path_style: bool,
    /// Give up retrying transient failures after this long
    pub max_retry_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "objects".to_string(),
            prefix: None,
            endpoint_url: None,
            region: None,
            force_path_style: true,
            max_retry_secs: 10,
        }
    }
}

/// S3-backed [`ObjectStore`]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    max_retry: Duration,
}

impl S3ObjectStore {
    /// Build a client from the standard AWS credential chain
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
            prefix: config.prefix,
            max_retry: Duration::from_secs(config.max_retry_secs),
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_elapsed_time: Some(self.max_retry),
            ..Default::default()
        }
    }

    /// Run an S3 call, retrying throttling and transport failures
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<Option<T>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Option<T>, backoff::Error<Error>>>,
    {
        backoff::future::retry_notify(self.retry_policy(), call, |err: Error, wait| {
            warn!(operation, error = %err, ?wait, "Retrying object store call");
        })
        .await
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}

fn classify<E: std::error::Error + Send + Sync + 'static>(
    operation: &'static str,
    err: SdkError<E>,
) -> backoff::Error<Error> {
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(e) => {
            let status = e.raw().status().as_u16();
            status == 429 || status >= 500
        }
        _ => false,
    };
    let err = Error::backend(operation, aws_sdk_s3::error::DisplayErrorContext(err));
    if transient {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let key = &self.full_key(key);
        let (client, bucket, data) = (&self.client, &self.bucket, &data);
        self.with_retry("put", move || async move {
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(S3Body::from(data.clone()))
                .send()
                .await
                .map(|_| Some(()))
                .map_err(|e| classify("put", e))
        })
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(stream) = self.get_stream(key).await? else {
            return Ok(None);
        };
        let data = stream
            .collect_bytes()
            .await
            .map_err(|e| Error::backend("get", e))?;
        Ok(Some(data))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<ObjectStream>> {
        let key = &self.full_key(key);
        let (client, bucket) = (&self.client, &self.bucket);
        let response = self
            .with_retry("get", move || async move {
                match client.get_object().bucket(bucket).key(key).send().await {
                    Ok(response) => Ok(Some(response)),
                    Err(e) if is_not_found(&e) => Ok(None),
                    Err(e) => Err(classify("get", e)),
                }
            })
            .await?;

        Ok(response.map(|response| {
            let size = response.content_length().unwrap_or_default().max(0) as u64;
            let body = ReaderStream::new(response.body.into_async_read()).boxed();
            ObjectStream::new(size, body)
        }))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        let key = &self.full_key(key);
        let (client, bucket) = (&self.client, &self.bucket);
        self.with_retry("head", move || async move {
            match client.head_object().bucket(bucket).key(key).send().await {
                Ok(response) => Ok(Some(response.content_length().unwrap_or_default().max(0) as u64)),
                Err(e) if is_not_found(&e) => Ok(None),
                Err(e) => Err(classify("head", e)),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = &self.full_key(key);
        let (client, bucket) = (&self.client, &self.bucket);
        self.with_retry("delete", move || async move {
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map(|_| Some(()))
                .map_err(|e| classify("delete", e))
        })
        .await?;
        Ok(())
    }
}

// =============================================================================
// Object Storage Backend (CacheLayer adapter)
// =============================================================================

/// The unbounded, never-evicting last tier
pub struct ObjectStorageBackend {
    store: Arc<dyn ObjectStore>,
    counters: LayerCounters,
}

impl ObjectStorageBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            counters: LayerCounters::new(),
        }
    }

    /// In-memory backend, handy for tests and local runs
    pub fn in_memory() -> (Self, Arc<InMemoryObjectStore>) {
        let store = Arc::new(InMemoryObjectStore::new());
        (Self::new(store.clone()), store)
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Size of an object without reading it or touching counters
    pub async fn head(&self, id: &ObjectId) -> Result<Option<u64>> {
        self.store.head(id.as_str()).await
    }

    fn failed(&self, err: Error) -> Error {
        self.counters.record_error();
        err
    }
}

#[async_trait]
impl CacheLayer for ObjectStorageBackend {
    fn tier(&self) -> CacheTier {
        CacheTier::ObjectStorage
    }

    async fn store(&self, id: &ObjectId, data: Bytes) -> Result<()> {
        let start = Instant::now();
        self.store
            .put(id.as_str(), data)
            .await
            .map_err(|e| self.failed(e))?;
        self.counters.record_latency(start.elapsed());
        Ok(())
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        let start = Instant::now();
        let data = self.store.get(id.as_str()).await.map_err(|e| self.failed(e))?;
        match &data {
            Some(_) => self.counters.record_hit(),
            None => self.counters.record_miss(),
        }
        self.counters.record_latency(start.elapsed());
        Ok(data)
    }

    async fn get_stream(&self, id: &ObjectId) -> Result<Option<ObjectStream>> {
        let start = Instant::now();
        let stream = self
            .store
            .get_stream(id.as_str())
            .await
            .map_err(|e| self.failed(e))?;
        match &stream {
            Some(_) => self.counters.record_hit(),
            None => self.counters.record_miss(),
        }
        self.counters.record_latency(start.elapsed());
        Ok(stream)
    }

    async fn exists(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.store.head(id.as_str()).await?.is_some())
    }

    async fn delete(&self, id: &ObjectId) -> Result<()> {
        self.store
            .delete(id.as_str())
            .await
            .map_err(|e| self.failed(e))
    }

    /// Durable objects are never flushed; only the counters reset
    async fn clear(&self) -> Result<()> {
        debug!(store = self.store.name(), "Object storage counters reset");
        self.counters.reset();
        Ok(())
    }

    async fn stats(&self) -> LayerStats {
        let (objects, bytes) = self.store.usage().await.unwrap_or_default();
        self.counters
            .layer_stats(CacheTier::ObjectStorage, objects, bytes, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_backend_round_trip() {
        let (backend, store) = ObjectStorageBackend::in_memory();
        let id = ObjectId::new("a1");

        backend.store(&id, Bytes::from("0123456789")).await.unwrap();
        assert!(backend.exists(&id).await.unwrap());
        assert_eq!(backend.head(&id).await.unwrap(), Some(10));

        let stream = backend.get_stream(&id).await.unwrap().unwrap();
        assert_eq!(stream.size(), 10);
        assert_eq!(stream.collect_bytes().await.unwrap(), Bytes::from("0123456789"));
        assert!(store.reads() >= 2);

        backend.delete(&id).await.unwrap();
        backend.delete(&id).await.unwrap();
        assert!(backend.get(&id).await.unwrap().is_none());

        let stats = backend.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.capacity_bytes, None);
    }

    #[tokio::test]
    async fn test_injected_failure_surfaces_as_backend_error() {
        let (backend, store) = ObjectStorageBackend::in_memory();
        let id = ObjectId::new("b");
        backend.store(&id, Bytes::from("x")).await.unwrap();

        store.fail_key("b");
        let err = backend.get(&id).await.unwrap_err();
        assert_matches!(err, Error::Backend { .. });
        assert_eq!(backend.stats().await.errors, 1);

        store.heal("b");
        assert!(backend.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_keeps_durable_objects() {
        let (backend, _store) = ObjectStorageBackend::in_memory();
        let id = ObjectId::new("keep");
        backend.store(&id, Bytes::from("x")).await.unwrap();
        backend.get(&id).await.unwrap();

        backend.clear().await.unwrap();
        assert!(backend.exists(&id).await.unwrap());

        let stats = backend.stats().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.object_count, 1);
    }
}
