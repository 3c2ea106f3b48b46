//! Cache Error Taxonomy
//!
//! A single error type shared by every tier so the registry can hand lower
//! layer failures to callers without flattening them. The enum is `Clone`:
//! every caller joined to the same download observes the same failure value.

use std::sync::Arc;

use thiserror::Error;

use crate::format::ArtifactFormat;

/// Convenience alias used throughout the crate
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors produced by the artifact cache
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Content hash of the artifact does not match the expected digest
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected hex digest
        expected: String,
        /// Computed hex digest
        actual: String,
    },

    /// Detected container format differs from the declared one
    #[error("format mismatch: declared {expected}, detected {detected}")]
    FormatMismatch {
        /// Declared format
        expected: ArtifactFormat,
        /// Detected format
        detected: ArtifactFormat,
    },

    /// Artifact length differs from the expected length
    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        /// Expected size in bytes
        expected: u64,
        /// Actual size in bytes
        actual: u64,
    },

    /// Not enough disk space (or quota) to store the artifact
    #[error("insufficient storage: {required} bytes required, {available} bytes available")]
    InsufficientStorage {
        /// Bytes needed
        required: u64,
        /// Bytes available
        available: u64,
    },

    /// Transport failure while fetching an artifact
    #[error("network error: {0}")]
    Network(String),

    /// Download made no progress within the stall timeout
    #[error("download of '{key}' stalled for {secs}s")]
    Stalled {
        /// Artifact key
        key: String,
        /// Stall timeout in seconds
        secs: u64,
    },

    /// Caller-imposed deadline elapsed before resolution finished
    #[error("resolving '{key}' timed out after {secs}s")]
    Timeout {
        /// Artifact key
        key: String,
        /// Deadline in seconds
        secs: u64,
    },

    /// No cached copy and no source to fetch from
    #[error("artifact '{0}' not found")]
    NotFound(String),

    /// The in-flight download was cancelled
    #[error("download of '{0}' was cancelled")]
    Cancelled(String),

    /// A durable entry failed its integrity re-check and was evicted
    #[error("artifact '{key}' is corrupted: {reason}")]
    Corrupted {
        /// Artifact key
        key: String,
        /// What failed
        reason: String,
    },

    /// The key cannot be used as a cache key
    #[error("invalid artifact key: {0:?}")]
    InvalidKey(String),

    /// Metadata record could not be encoded or decoded
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl CacheError {
    /// Whether retrying the same operation later may succeed
    ///
    /// Integrity failures are never retryable: the remote content itself may
    /// be wrong, so the caller has to re-initiate deliberately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Stalled { .. }
                | Self::Timeout { .. }
                | Self::InsufficientStorage { .. }
        )
    }

    /// Whether this failure is a transient transport error that the download
    /// coordinator retries on its own
    #[must_use]
    pub fn is_transient_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Whether this failure indicates bad artifact content
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::SizeMismatch { .. }
                | Self::FormatMismatch { .. }
                | Self::Corrupted { .. }
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Metadata(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
