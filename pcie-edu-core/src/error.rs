//! Error types for the PCIe device model.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Setup paths return these errors; teardown paths never do.

use crate::types::FunctionId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for device model operations.
pub type Result<T> = std::result::Result<T, EduError>;

/// Main error type for the PCIe device model.
#[derive(Error, Debug)]
pub enum EduError {
    // Layout errors (programming/config errors, never retried)
    #[error("Slot conflict on function {function}: {what} already occupied")]
    SlotConflict { function: FunctionId, what: String },

    #[error("Invalid size {size:#x} for BAR {slot} of function {function}: {reason}")]
    SizeInvalid { function: FunctionId, slot: u8, size: u64, reason: String },

    #[error("MSI-X layout invalid on function {function}: {reason}")]
    OffsetOverlap { function: FunctionId, reason: String },

    #[error("MSI-X table of function {function} references BAR {slot} which is not reserved")]
    BarMissing { function: FunctionId, slot: u8 },

    // Capacity errors (recoverable by asking for less)
    #[error("Resource exhausted: {resource} (requested {requested}, limit {limit})")]
    ResourceExhausted { resource: &'static str, requested: u64, limit: u64 },

    // Vector manager misuse
    #[error("MSI-X vector {index} out of range on function {function} (table has {count})")]
    IndexOutOfRange { function: FunctionId, index: u16, count: u16 },

    #[error("MSI-X vector {index} already in use on function {function}")]
    AlreadyInUse { function: FunctionId, index: u16 },

    #[error("Unknown MSI-X table handle {handle}")]
    UnknownTable { handle: u64 },

    // Lifecycle errors
    #[error("Function {function} cannot {operation} while {state}")]
    InvalidState { function: FunctionId, operation: &'static str, state: String },

    #[error("Invalid MMIO access to function {function}: {reason}")]
    InvalidAccess { function: FunctionId, reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EduError {
    /// Programming or layout errors. Retrying cannot change the outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SlotConflict { .. }
                | Self::SizeInvalid { .. }
                | Self::OffsetOverlap { .. }
                | Self::BarMissing { .. }
                | Self::IndexOutOfRange { .. }
                | Self::AlreadyInUse { .. }
                | Self::Internal(_)
        )
    }

    /// The caller may succeed by asking for fewer resources.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// Short label used as a metrics dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SlotConflict { .. } => "slot_conflict",
            Self::SizeInvalid { .. } => "size_invalid",
            Self::OffsetOverlap { .. } => "offset_overlap",
            Self::BarMissing { .. } => "bar_missing",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::AlreadyInUse { .. } => "already_in_use",
            Self::UnknownTable { .. } => "unknown_table",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidAccess { .. } => "invalid_access",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::IoError { .. } => "io",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = EduError::ResourceExhausted { resource: "msix vectors", requested: 3, limit: 2 };
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());
        assert_eq!(err.reason(), "resource_exhausted");

        let err = EduError::BarMissing { function: FunctionId::new(0), slot: 2 };
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = EduError::SlotConflict {
            function: FunctionId::new(0x0082),
            what: "BAR 0".to_string(),
        };
        assert_eq!(err.to_string(), "Slot conflict on function 00:10.2: BAR 0 already occupied");
    }
}
