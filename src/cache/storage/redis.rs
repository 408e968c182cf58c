//! Redis Tier
//!
//! Shared remote tier. Expiry is delegated to Redis (`SET .. EX`), so there is
//! no local sweep. Large values are streamed with `GETRANGE` in fixed-size
//! chunks pulled on demand.
//!
//! Other processes write the same keys, so every value starts with a 16-byte
//! write token:
//!
//! ```text
//! <prefix><id>  =  [ token (16) | object bytes ... ]
//! ```
//!
//! The lookup and each chunk read fetch the token in the same MULTI/EXEC as
//! the bytes they need. A stream whose key is overwritten mid-read fails with
//! `InvalidData`; one whose key shrinks or vanishes fails with
//! `UnexpectedEof`. Neither yields a body mixing two writes.
//!
//! The connection is established lazily on first use: a Redis outage at
//! startup only makes this tier report misses.

use crate::cache::entry::{LayerStats, ObjectId};
use crate::cache::metrics::LayerCounters;
use crate::cache::tier::{CacheTier, LARGE_MAX_BYTES};
use crate::cache::{CacheLayer, ObjectStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Redis Cache Configuration
// =============================================================================

/// Configuration for the Redis tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCacheConfig {
    pub enabled: bool,
    pub url: String,
    /// Namespace for every key this tier owns
    pub key_prefix: String,
    pub ttl_secs: u64,
    /// Objects larger than this are never placed here
    pub max_object_size: u64,
    /// GETRANGE chunk size for streaming reads
    pub chunk_bytes: u64,
    /// Upper bound on any single command, including connecting
    pub command_timeout_ms: u64,
    /// SCAN COUNT hint for namespace walks
    pub scan_count: usize,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "obj:".to_string(),
            ttl_secs: 3600,
            max_object_size: LARGE_MAX_BYTES,
            chunk_bytes: 4 * 1024 * 1024,
            command_timeout_ms: 2000,
            scan_count: 500,
        }
    }
}

impl RedisCacheConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Inclusive `GETRANGE` bounds covering `[0, len)` in `chunk` sized steps
pub(crate) fn chunk_ranges(len: u64, chunk: u64) -> impl Iterator<Item = (u64, u64)> {
    let chunk = chunk.max(1);
    (0..len.div_ceil(chunk)).map(move |i| {
        let start = i * chunk;
        (start, (start + chunk).min(len) - 1)
    })
}

// =============================================================================
// Value Layout
// =============================================================================

/// Length of the write token stored ahead of every value
pub(crate) const TOKEN_BYTES: u64 = 16;

/// Identity of one `store`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteToken([u8; TOKEN_BYTES as usize]);

impl WriteToken {
    fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    fn from_slice(raw: &[u8]) -> Option<Self> {
        raw.try_into().ok().map(Self)
    }
}

fn encode_value(token: WriteToken, data: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(TOKEN_BYTES as usize + data.len());
    value.extend_from_slice(&token.0);
    value.extend_from_slice(data);
    value
}

fn malformed(key: &str, stored_len: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{} holds {} bytes, too short for a write token", key, stored_len),
    )
}

/// Object bytes of a whole stored value
fn decode_value(key: &str, value: Vec<u8>) -> io::Result<Bytes> {
    if (value.len() as u64) < TOKEN_BYTES {
        return Err(malformed(key, value.len() as u64));
    }
    Ok(Bytes::from(value).slice(TOKEN_BYTES as usize..))
}

/// Token and object size from a lookup; `None` when the key is absent
fn parse_head(key: &str, stored_len: u64, token: &[u8]) -> io::Result<Option<(WriteToken, u64)>> {
    if stored_len == 0 {
        return Ok(None);
    }
    match WriteToken::from_slice(token) {
        Some(token) if stored_len >= TOKEN_BYTES => Ok(Some((token, stored_len - TOKEN_BYTES))),
        _ => Err(malformed(key, stored_len)),
    }
}

/// `STRLEN` and the token, from one snapshot of the key
fn head_pipeline(key: &str) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("STRLEN")
        .arg(key)
        .cmd("GETRANGE")
        .arg(key)
        .arg(0)
        .arg(TOKEN_BYTES - 1);
    pipe
}

/// The token and object bytes `[start, end]`, from one snapshot of the key
fn chunk_pipeline(key: &str, start: u64, end: u64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("GETRANGE")
        .arg(key)
        .arg(0)
        .arg(TOKEN_BYTES - 1)
        .cmd("GETRANGE")
        .arg(key)
        .arg(start + TOKEN_BYTES)
        .arg(end + TOKEN_BYTES);
    pipe
}

/// One chunk together with the token the key carried when it was read
#[derive(Debug)]
pub(crate) struct ChunkRead {
    pub token: Vec<u8>,
    pub data: Vec<u8>,
}

/// Stream `size` bytes written under `token`, calling `fetch(start, end)`
/// for each chunk only when the consumer asks for it
pub(crate) fn versioned_chunks<F, Fut>(
    key: String,
    token: WriteToken,
    size: u64,
    chunk_bytes: u64,
    fetch: F,
) -> ObjectStream
where
    F: Fn(u64, u64) -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<ChunkRead>> + Send + 'static,
{
    let body = stream::iter(chunk_ranges(size, chunk_bytes))
        .then(move |(start, end)| {
            let read = fetch(start, end);
            let key = key.clone();
            async move {
                let ChunkRead { token: current, data } = read.await?;
                if current.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} vanished mid-stream at offset {}", key, start),
                    ));
                }
                if WriteToken::from_slice(&current) != Some(token) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} was overwritten mid-stream at offset {}", key, start),
                    ));
                }

                let expected = end - start + 1;
                if data.len() as u64 != expected {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "{} changed mid-stream: expected {} bytes at offset {}, got {}",
                            key,
                            expected,
                            start,
                            data.len()
                        ),
                    ));
                }
                Ok(Bytes::from(data))
            }
        })
        .boxed();

    ObjectStream::new(size, body)
}

// =============================================================================
// Redis Cache
// =============================================================================

/// Remote tier backed by a single Redis endpoint
pub struct RedisCache {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    counters: LayerCounters,
    config: RedisCacheConfig,
}

impl RedisCache {
    /// Parse the URL; no connection is made until the first command
    pub fn with_config(config: RedisCacheConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| Error::Configuration(format!("invalid Redis URL {}: {}", config.url, e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            counters: LayerCounters::new(),
            config,
        })
    }

    pub fn config(&self) -> &RedisCacheConfig {
        &self.config
    }

    pub fn key(&self, id: &ObjectId) -> String {
        format!("{}{}", self.config.key_prefix, id)
    }

    /// `SCAN MATCH` pattern for the prefix, with glob characters escaped
    fn namespace_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.config.key_prefix.len() + 1);
        for c in self.config.key_prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }

    fn owns(&self, key: &str) -> bool {
        key.starts_with(&self.config.key_prefix)
    }

    fn scan_command(&self, cursor: u64) -> redis::Cmd {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(self.namespace_pattern())
            .arg("COUNT")
            .arg(self.config.scan_count);
        cmd
    }

    /// `DEL` for the keys of a scan batch that sit under the prefix
    fn delete_command(&self, keys: &[String]) -> Option<redis::Cmd> {
        let owned: Vec<&str> = keys
            .iter()
            .map(String::as_str)
            .filter(|key| self.owns(key))
            .collect();
        if owned.is_empty() {
            return None;
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(owned);
        Some(cmd)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let timeout = self.config.command_timeout();
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let conn = tokio::time::timeout(timeout, ConnectionManager::new(self.client.clone()))
                    .await
                    .map_err(|_| Error::TierTimeout {
                        tier: CacheTier::Redis,
                        timeout,
                    })?
                    .map_err(|e| Error::unavailable(CacheTier::Redis, e))?;
                info!(url = %self.config.url, "Connected to Redis");
                Ok::<_, Error>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Run one command under the configured timeout, counting failures
    async fn run<T, F, Fut>(&self, command: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let result = match self.connection().await {
            Ok(conn) => {
                let timeout = self.config.command_timeout();
                match tokio::time::timeout(timeout, command(conn)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(Error::unavailable(CacheTier::Redis, e)),
                    Err(_) => Err(Error::TierTimeout {
                        tier: CacheTier::Redis,
                        timeout,
                    }),
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.counters.record_error();
            debug!(error = %e, "Redis command failed");
        }
        result
    }

    async fn query<T: FromRedisValue + Send>(&self, cmd: redis::Cmd) -> Result<T> {
        self.run(|mut conn| async move { cmd.query_async::<_, T>(&mut conn).await })
            .await
    }

    /// One SCAN step over this tier's namespace
    async fn scan_batch(&self, cursor: u64) -> Result<(u64, Vec<String>)> {
        let (next, keys): (u64, Vec<String>) = self.query(self.scan_command(cursor)).await?;
        Ok((next, keys.into_iter().filter(|key| self.owns(key)).collect()))
    }

    async fn namespace_usage(&self) -> Result<(u64, u64)> {
        let (mut objects, mut bytes) = (0u64, 0u64);
        let mut cursor = 0;
        loop {
            let (next, keys) = self.scan_batch(cursor).await?;
            if !keys.is_empty() {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.cmd("STRLEN").arg(key);
                }
                let lens: Vec<u64> = self
                    .run(|mut conn| async move { pipe.query_async(&mut conn).await })
                    .await?;
                objects += keys.len() as u64;
                bytes += lens
                    .iter()
                    .map(|len| len.saturating_sub(TOKEN_BYTES))
                    .sum::<u64>();
            }
            cursor = next;
            if cursor == 0 {
                return Ok((objects, bytes));
            }
        }
    }

    fn chunk_stream(
        &self,
        conn: ConnectionManager,
        key: String,
        token: WriteToken,
        size: u64,
    ) -> ObjectStream {
        let timeout = self.config.command_timeout();
        let fetch_key = key.clone();

        versioned_chunks(key, token, size, self.config.chunk_bytes, move |start, end| {
            let mut conn = conn.clone();
            let pipe = chunk_pipeline(&fetch_key, start, end);
            async move {
                let (token, data): (Vec<u8>, Vec<u8>) =
                    tokio::time::timeout(timeout, pipe.query_async(&mut conn))
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "GETRANGE timed out"))?
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(ChunkRead { token, data })
            }
        })
    }

    fn malformed_value(&self, err: io::Error) -> Error {
        self.counters.record_error();
        Error::unavailable(CacheTier::Redis, err)
    }
}

#[async_trait]
impl CacheLayer for RedisCache {
    fn tier(&self) -> CacheTier {
        CacheTier::Redis
    }

    fn max_object_size(&self) -> u64 {
        self.config.max_object_size
    }

    async fn store(&self, id: &ObjectId, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        if size > self.config.max_object_size {
            return Err(Error::CapacityExceeded {
                tier: CacheTier::Redis,
                requested: size,
                capacity: self.config.max_object_size,
            });
        }

        let start = Instant::now();
        let value = encode_value(WriteToken::generate(), &data);
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(id))
            .arg(value)
            .arg("EX")
            .arg(self.config.ttl_secs.max(1));
        self.query::<()>(cmd).await?;
        self.counters.record_latency(start.elapsed());

        debug!(object_id = %id, size_bytes = size, "Stored in Redis");
        Ok(())
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        let start = Instant::now();
        let key = self.key(id);
        let mut cmd = redis::cmd("GET");
        cmd.arg(&key);
        let value: Option<Vec<u8>> = self.query(cmd).await?;
        self.counters.record_latency(start.elapsed());

        match value {
            Some(value) => {
                let data = decode_value(&key, value).map_err(|e| self.malformed_value(e))?;
                self.counters.record_hit();
                Ok(Some(data))
            }
            None => {
                self.counters.record_miss();
                Ok(None)
            }
        }
    }

    async fn get_stream(&self, id: &ObjectId) -> Result<Option<ObjectStream>> {
        let start = Instant::now();
        let key = self.key(id);

        // Even an empty object carries its token, so STRLEN 0 means absent
        let pipe = head_pipeline(&key);
        let (stored_len, token): (u64, Vec<u8>) = self
            .run(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;
        self.counters.record_latency(start.elapsed());

        let (token, size) = match parse_head(&key, stored_len, &token) {
            Ok(Some(head)) => head,
            Ok(None) => {
                self.counters.record_miss();
                return Ok(None);
            }
            Err(e) => return Err(self.malformed_value(e)),
        };
        self.counters.record_hit();

        let conn = self.connection().await?;
        Ok(Some(self.chunk_stream(conn, key, token, size)))
    }

    async fn exists(&self, id: &ObjectId) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(self.key(id));
        self.query(cmd).await
    }

    async fn delete(&self, id: &ObjectId) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.key(id));
        self.query::<u64>(cmd).await?;
        Ok(())
    }

    /// Delete only keys under this tier's prefix
    async fn clear(&self) -> Result<()> {
        let mut deleted = 0usize;
        let mut cursor = 0;
        loop {
            let (next, keys) = self.scan_batch(cursor).await?;
            if let Some(cmd) = self.delete_command(&keys) {
                deleted += keys.len();
                self.query::<u64>(cmd).await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        self.counters.reset();
        info!(deleted, prefix = %self.config.key_prefix, "Redis namespace cleared");
        Ok(())
    }

    async fn stats(&self) -> LayerStats {
        let (objects, bytes) = match self.namespace_usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Could not size Redis namespace");
                (0, 0)
            }
        };
        self.counters.layer_stats(CacheTier::Redis, objects, bytes, None)
    }

    async fn health_check(&self) -> Result<bool> {
        let pong: String = self.query(redis::cmd("PING")).await?;
        Ok(pong == "PONG")
    }
}
