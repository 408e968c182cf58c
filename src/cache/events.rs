//! Cache Events
//!
//! Events published by the orchestrator for monitoring and observability.

use crate::cache::entry::ObjectId;
use crate::cache::tier::CacheTier;
use serde::{Deserialize, Serialize};

/// Events emitted by the cache engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEvent {
    /// Object written to the backend and fanned out to bounded tiers
    Stored {
        id: String,
        size_bytes: u64,
        tiers: Vec<CacheTier>,
    },

    /// Download served by a tier
    Hit { id: String, tier: CacheTier },

    /// Download fell through every bounded tier
    Miss { id: String },

    /// Object copied into a faster tier after a hit below it
    Promoted {
        id: String,
        from_tier: CacheTier,
        to_tier: CacheTier,
        size_bytes: u64,
    },

    /// Object removed from tiers
    Invalidated {
        id: String,
        include_backend: bool,
    },

    /// A tier operation failed and was absorbed
    TierUnavailable { tier: CacheTier, reason: String },

    /// Preload batch finished
    PreloadComplete {
        requested: usize,
        succeeded: usize,
        failed: usize,
        bytes_loaded: u64,
    },

    /// Administrative flush of a tier
    TierCleared { tier: CacheTier },
}

/// Reason an entry left a bounded tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// Capacity limit reached
    Capacity,
    /// Entry expired (TTL)
    Expired,
    /// Delete or invalidate request
    Manual,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Capacity => write!(f, "capacity"),
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Manual => write!(f, "manual"),
        }
    }
}

impl CacheEvent {
    pub fn hit(id: &ObjectId, tier: CacheTier) -> Self {
        CacheEvent::Hit {
            id: id.to_string(),
            tier,
        }
    }

    pub fn miss(id: &ObjectId) -> Self {
        CacheEvent::Miss { id: id.to_string() }
    }

    pub fn promoted(id: &ObjectId, from_tier: CacheTier, to_tier: CacheTier, size_bytes: u64) -> Self {
        CacheEvent::Promoted {
            id: id.to_string(),
            from_tier,
            to_tier,
            size_bytes,
        }
    }

    /// Get the object id associated with this event (if any)
    pub fn id(&self) -> Option<&str> {
        match self {
            CacheEvent::Stored { id, .. }
            | CacheEvent::Hit { id, .. }
            | CacheEvent::Miss { id }
            | CacheEvent::Promoted { id, .. }
            | CacheEvent::Invalidated { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(self, CacheEvent::TierUnavailable { .. })
    }
}
