//! Engine Configuration
//!
//! One [`EngineConfig`] describes every tier, the backend and the preloader.
//! It can be loaded from YAML; every section falls back to its defaults.
//!
//! ```yaml
//! memory:
//!   capacity_bytes: 536870912
//! filesystem:
//!   root_path: /var/cache/objects
//! redis:
//!   enabled: false
//! backend:
//!   kind: s3
//!   s3:
//!     bucket: assets
//!     endpoint_url: http://minio:9000
//! ```

use crate::cache::preload::PreloadConfig;
use crate::cache::storage::{FileSystemCacheConfig, MemoryCacheConfig, RedisCacheConfig, S3Config};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which durable store backs the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local store; contents vanish on restart
    #[default]
    Memory,
    /// Any S3-compatible endpoint
    #[serde(alias = "minio")]
    S3,
}

impl BackendKind {
    /// Whether stored objects survive a process restart
    pub fn is_durable(&self) -> bool {
        matches!(self, BackendKind::S3)
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "s3" | "minio" => Ok(BackendKind::S3),
            other => Err(Error::Configuration(format!("unknown backend kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub s3: S3Config,
}

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory: MemoryCacheConfig,
    pub filesystem: FileSystemCacheConfig,
    pub redis: RedisCacheConfig,
    pub backend: BackendConfig,
    pub preload: PreloadConfig,
    /// Buffered events per subscriber before the slowest one starts lagging
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory: MemoryCacheConfig::default(),
            filesystem: FileSystemCacheConfig::default(),
            redis: RedisCacheConfig::default(),
            backend: BackendConfig::default(),
            preload: PreloadConfig::default(),
            event_buffer: 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject settings no tier could operate with
    pub fn validate(&self) -> Result<()> {
        if self.memory.enabled {
            check_bounded("memory", self.memory.capacity_bytes, self.memory.max_object_size)?;
            if self.memory.stream_chunk_bytes == 0 {
                return Err(invalid("memory.stream_chunk_bytes must be greater than zero"));
            }
        }
        if self.filesystem.enabled {
            check_bounded(
                "filesystem",
                self.filesystem.capacity_bytes,
                self.filesystem.max_object_size,
            )?;
            if self.filesystem.root_path.as_os_str().is_empty() {
                return Err(invalid("filesystem.root_path must not be empty"));
            }
        }
        if self.redis.enabled {
            if self.redis.chunk_bytes == 0 {
                return Err(invalid("redis.chunk_bytes must be greater than zero"));
            }
            if self.redis.key_prefix.is_empty() {
                return Err(invalid("redis.key_prefix must not be empty"));
            }
            if self.redis.command_timeout_ms == 0 {
                return Err(invalid("redis.command_timeout_ms must be greater than zero"));
            }
        }
        if self.backend.kind == BackendKind::S3 && self.backend.s3.bucket.is_empty() {
            return Err(invalid("backend.s3.bucket must be set"));
        }
        if self.preload.max_concurrent == 0 {
            return Err(invalid("preload.max_concurrent must be greater than zero"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::Configuration(message.to_string())
}

fn check_bounded(tier: &str, capacity_bytes: u64, max_object_size: u64) -> Result<()> {
    if capacity_bytes == 0 {
        return Err(Error::Configuration(format!(
            "{}.capacity_bytes must be greater than zero",
            tier
        )));
    }
    if max_object_size > capacity_bytes {
        return Err(Error::Configuration(format!(
            "{}.max_object_size ({}) exceeds capacity ({})",
            tier, max_object_size, capacity_bytes
        )));
    }
    Ok(())
}
