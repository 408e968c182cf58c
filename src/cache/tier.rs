//! Cache Tier Definitions
//!
//! Defines the tier hierarchy and the size classes used for eligibility
//! decisions and metric labels.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Size Thresholds
// =============================================================================

const MIB: u64 = 1024 * 1024;

/// Upper bound of the `small` size class: 1 MiB
pub const SMALL_MAX_BYTES: u64 = MIB;

/// Upper bound of the `medium-small` size class: 8 MiB
pub const MEDIUM_SMALL_MAX_BYTES: u64 = 8 * MIB;

/// Upper bound of the `medium` size class: 32 MiB
pub const MEDIUM_MAX_BYTES: u64 = 32 * MIB;

/// Upper bound of the `large` size class: 100 MiB; anything bigger is `xlarge`
pub const LARGE_MAX_BYTES: u64 = 100 * MIB;

// =============================================================================
// Size Class
// =============================================================================

/// Coarse bucket for an object's byte size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeClass {
    Small,
    MediumSmall,
    Medium,
    Large,
    Xlarge,
}

impl SizeClass {
    /// Classify a byte size
    pub fn for_size(size_bytes: u64) -> Self {
        if size_bytes <= SMALL_MAX_BYTES {
            SizeClass::Small
        } else if size_bytes <= MEDIUM_SMALL_MAX_BYTES {
            SizeClass::MediumSmall
        } else if size_bytes <= MEDIUM_MAX_BYTES {
            SizeClass::Medium
        } else if size_bytes <= LARGE_MAX_BYTES {
            SizeClass::Large
        } else {
            SizeClass::Xlarge
        }
    }

    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::MediumSmall => "medium-small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
            SizeClass::Xlarge => "xlarge",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Cache Tier
// =============================================================================

/// A tier in the lookup waterfall, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheTier {
    /// In-process memory (fastest, smallest)
    #[default]
    Memory,
    /// Local disk
    #[serde(rename = "FILESYSTEM")]
    FileSystem,
    /// Shared remote Redis
    Redis,
    /// Durable object storage (authoritative, unbounded)
    ObjectStorage,
}

impl CacheTier {
    /// Name reported as `cacheLayerUsed` and used as the metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Memory => "MEMORY",
            CacheTier::FileSystem => "FILESYSTEM",
            CacheTier::Redis => "REDIS",
            CacheTier::ObjectStorage => "OBJECT_STORAGE",
        }
    }

    /// Whether this tier has a capacity limit and participates in the waterfall
    pub fn is_bounded(&self) -> bool {
        !matches!(self, CacheTier::ObjectStorage)
    }

    /// Get tier priority (lower is faster)
    pub fn priority(&self) -> u8 {
        match self {
            CacheTier::Memory => 0,
            CacheTier::FileSystem => 1,
            CacheTier::Redis => 2,
            CacheTier::ObjectStorage => 3,
        }
    }

    /// Check if this tier is faster than another
    pub fn is_faster_than(&self, other: &CacheTier) -> bool {
        self.priority() < other.priority()
    }

    /// Get all tiers in lookup order
    pub fn lookup_order() -> &'static [CacheTier] {
        &[
            CacheTier::Memory,
            CacheTier::FileSystem,
            CacheTier::Redis,
            CacheTier::ObjectStorage,
        ]
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
