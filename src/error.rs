//! Error types for the tiered object cache
//!
//! Tier-local failures (`TierUnavailable`, `CapacityExceeded`) are absorbed by
//! the orchestrator; only `ObjectNotFound` and backend failures ever reach a
//! caller, and those are collapsed into an [`Outcome`].

use crate::cache::tier::CacheTier;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Tier Errors
    // =========================================================================
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: CacheTier, reason: String },

    #[error("Tier {tier} capacity exceeded: requested {requested} bytes, capacity {capacity} bytes")]
    CapacityExceeded {
        tier: CacheTier,
        requested: u64,
        capacity: u64,
    },

    #[error("Tier {tier} operation timed out after {timeout:?}")]
    TierTimeout { tier: CacheTier, timeout: Duration },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Object not found: {id}")]
    ObjectNotFound { id: String },

    #[error("Backend operation failed: {operation}: {reason}")]
    Backend { operation: String, reason: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// What a caller of the engine gets to see for a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Definitive absence: no tier, including the backend, holds the object
    NotFound,
    /// Anything else
    Internal,
}

impl Error {
    /// Build a `TierUnavailable` from any displayable cause
    pub fn unavailable(tier: CacheTier, reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier,
            reason: reason.to_string(),
        }
    }

    /// Build a `Backend` error from any displayable cause
    pub fn backend(operation: &str, reason: impl std::fmt::Display) -> Self {
        Error::Backend {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors scoped to a single bounded tier; the orchestrator logs them and moves on
    pub fn is_tier_local(&self) -> bool {
        matches!(
            self,
            Error::TierUnavailable { .. }
                | Error::CapacityExceeded { .. }
                | Error::TierTimeout { .. }
        )
    }

    /// Check if this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TierUnavailable { .. } | Error::TierTimeout { .. } | Error::Backend { .. }
        )
    }

    /// Map onto the caller-visible outcome
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::ObjectNotFound { .. } => Outcome::NotFound,
            _ => Outcome::Internal,
        }
    }

    /// Short reason label used for metrics
    pub fn reason_label(&self) -> &'static str {
        match self {
            Error::TierUnavailable { .. } => "unavailable",
            Error::CapacityExceeded { .. } => "capacity",
            Error::TierTimeout { .. } => "timeout",
            Error::ObjectNotFound { .. } => "not_found",
            Error::Backend { .. } => "backend",
            Error::Io(_) => "io",
            _ => "internal",
        }
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;
