//! Error types for the SMR storage core
//!
//! Exhaustion (`NoSpaceAvailable`) and benign skips (`NotAttempted`) are
//! ordinary outcomes callers branch on; everything else is a failure of the
//! operation that produced it.

use crate::types::{ZoneConditionSnapshot, ZoneDescriptor};
use thiserror::Error;

/// Common result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for storage operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    /// Physical I/O failed after every retry
    #[error("I/O error: {0}")]
    Io(String),

    #[error("no space available: {0}")]
    NoSpaceAvailable(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("corruption: {message}\n{snapshot}")]
    DiagnosedCorruption {
        message: String,
        snapshot: ZoneConditionSnapshot,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not attempted: {0}")]
    NotAttempted(String),

    /// Metadata was persisted to fewer superblocks than required
    #[error("superblock I/O error: {0}")]
    SuperblockIo(String),

    #[error("failed to allocate zone {zone}: {reason}{}", .diagnostics.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
    ZoneAllocation {
        zone: u32,
        reason: String,
        diagnostics: Option<ZoneDescriptor>,
    },

    #[error("zone {zone} allocated at LBA {actual}, expected {expected}")]
    LbaMismatch { zone: u32, expected: u64, actual: u64 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a no-space error
    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::NoSpaceAvailable(msg.into())
    }

    /// Create a not-attempted outcome
    pub fn not_attempted(msg: impl Into<String>) -> Self {
        Self::NotAttempted(msg.into())
    }

    /// Check if this is a capacity condition
    #[must_use]
    pub const fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpaceAvailable(_))
    }

    /// Check if this is a benign skip
    #[must_use]
    pub const fn is_not_attempted(&self) -> bool {
        matches!(self, Self::NotAttempted(_))
    }

    /// Check if this reports corrupted on-disk state
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::DiagnosedCorruption { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if the caller may retry after freeing space or waiting
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoSpaceAvailable(_) => true,
            Self::DiskIo(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZoneCondition;

    #[test]
    fn test_error_classification() {
        assert!(Error::no_space("zone").is_no_space());
        assert!(Error::no_space("zone").is_retryable());
        assert!(Error::not_attempted("skip").is_not_attempted());
        assert!(Error::corruption("bad").is_corruption());
        assert!(!Error::Io("pwrite".into()).is_retryable());
        assert!(!Error::LbaMismatch {
            zone: 1,
            expected: 2,
            actual: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_zone_allocation_display() {
        let err = Error::ZoneAllocation {
            zone: 70,
            reason: "reset failed".into(),
            diagnostics: Some(ZoneDescriptor {
                zone: 70,
                condition: ZoneCondition::Offline,
                start_lba: 70 * 2048,
                write_pointer: 70 * 2048,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("zone 70"));
        assert!(msg.contains("OFFLINE"));

        let bare = Error::ZoneAllocation {
            zone: 5,
            reason: "busy".into(),
            diagnostics: None,
        };
        assert_eq!(bare.to_string(), "failed to allocate zone 5: busy");
    }

    #[test]
    fn test_diagnosed_corruption_carries_snapshot() {
        let err = Error::DiagnosedCorruption {
            message: "bad footer".into(),
            snapshot: ZoneConditionSnapshot {
                counts: vec![(ZoneCondition::Full, 4)],
            },
        };
        assert!(err.is_corruption());
        assert!(err.to_string().contains("FULL"));
    }
}
