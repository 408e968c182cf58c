//! Cache Storage Backends
//!
//! One [`CacheLayer`](crate::cache::CacheLayer) implementation per tier,
//! fastest first.

mod filesystem;
mod memory;
mod object_store;
mod redis;

pub use filesystem::{FileSystemCache, FileSystemCacheConfig};
pub use memory::{MemoryCache, MemoryCacheConfig};
pub use object_store::{InMemoryObjectStore, ObjectStorageBackend, ObjectStore, S3Config, S3ObjectStore};
pub use redis::{RedisCache, RedisCacheConfig};
