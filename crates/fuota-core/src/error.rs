//! # Error Types
//!
//! Domain-specific error types for fuota-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fuota-core errors (this file)                                         │
//! │  ├── CoreError        - State machine / domain rule violations         │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  fuota-db errors (separate crate)                                      │
//! │  └── DbError          - Store failures (NotFound, AlreadyExists, ...)  │
//! │                                                                         │
//! │  fuota-ns errors (separate crate)                                      │
//! │  └── NsError          - Network-server and configuration failures      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError / DbError → NsError → caller        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every layer exposes an [`ErrorKind`] so callers branch on a tag instead of
//! matching on message text.

use thiserror::Error;

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse classification shared by every error type in the workspace.
///
/// The step executor uses this to decide what to do with a failed call:
/// `NotFound` on update means another worker already finished the unit,
/// `AlreadyExists` means the create was a replay, `Infrastructure` is
/// transient and should be retried on the next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Identity absent, or an update touched zero rows.
    NotFound,
    /// Unique constraint violated on create.
    AlreadyExists,
    /// The row exists but is held by another claim or is in the wrong state.
    Conflict,
    /// Input rejected before any write.
    Invalid,
    /// Connection, migration or other backend failure.
    Infrastructure,
}

// =============================================================================
// Core Error
// =============================================================================

/// Domain rule violations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A deployment state transition that goes backwards or stays in place.
    ///
    /// ## When This Occurs
    /// - Advancing a deployment that is already DONE
    /// - Requesting a target state that precedes the current one
    #[error("Invalid deployment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A per-device outcome that is already terminal was asked to change.
    #[error("Device {dev_eui} already has terminal state {state}")]
    DeviceStateTerminal { dev_eui: String, state: String },

    /// Retry budget exhausted for a provisioning session.
    #[error("Retry limit of {max} reached")]
    RetriesExhausted { max: i32 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidTransition { .. }
            | CoreError::DeviceStateTerminal { .. }
            | CoreError::RetriesExhausted { .. } => ErrorKind::Conflict,
            CoreError::Validation(_) => ErrorKind::Invalid,
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any write so that invalid records never reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Byte field has the wrong length.
    #[error("{field} must be exactly {expected} bytes, got {actual}")]
    InvalidLength {
        field: String,
        expected: usize,
        actual: usize,
    },

    /// Invalid format (e.g., invalid EUI, invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Duplicate value inside a single request.
    #[error("{field} '{value}' is listed more than once")]
    Duplicate { field: String, value: String },

    /// Two fields disagree with each other.
    #[error("{field} is inconsistent: {reason}")]
    Inconsistent { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidTransition {
            from: "DONE".to_string(),
            to: "MC_CREATE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid deployment transition from DONE to MC_CREATE"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::InvalidLength {
            field: "descriptor".to_string(),
            expected: 4,
            actual: 3,
        };
        assert_eq!(err.to_string(), "descriptor must be exactly 4 bytes, got 3");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "name".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(core_err.kind(), ErrorKind::Invalid);
    }
}
