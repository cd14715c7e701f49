use crate::topology::TopoLevel;
use crate::types::Rank;

pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors produced by group derivation and the point-to-point engine.
///
/// The enum derives `Clone` because topology and algo-group derivation cache
/// permanent failures and hand the same error back on every subsequent lookup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MeshError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("allocation failed: {reason}")]
    OutOfMemory { reason: String },

    #[error("hierarchy level {level} unavailable: {reason}")]
    Unsupported { level: TopoLevel, reason: String },

    #[error("location query failed for rank {rank}: {reason}")]
    Location { rank: Rank, reason: String },

    #[error("transport resource error: {reason}")]
    Resource { reason: String },

    #[error("unpack length mismatch: expected at most {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

impl MeshError {
    /// Create an `InvalidArgument` error from a message.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a `Resource` error from a message.
    pub fn resource(reason: impl Into<String>) -> Self {
        Self::Resource {
            reason: reason.into(),
        }
    }

    /// Create a `Location` error for a specific rank.
    pub fn location(rank: Rank, reason: impl Into<String>) -> Self {
        Self::Location {
            rank,
            reason: reason.into(),
        }
    }

    /// True for failures that may succeed on retry (allocation pressure).
    ///
    /// Derivation caches treat these as transient: the cache cell is left
    /// unresolved so a later call recomputes.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
