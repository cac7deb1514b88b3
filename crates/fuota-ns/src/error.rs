//! # Network-Server Error Types
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Local store         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  ConnectFailed  │  │  Database(DbError)      │ │
//! │  │  ConfigLoad…    │  │  Timeout        │  │  Validation             │ │
//! │  │  ConfigSave…    │  │  Rpc            │  │                         │ │
//! │  │                 │  │  RemoteNotFound │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use fuota_core::{ErrorKind, ValidationError};
use fuota_db::DbError;
use thiserror::Error;

/// Result type alias for network-server operations.
pub type NsResult<T> = Result<T, NsError>;

#[derive(Debug, Error)]
pub enum NsError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Could not establish a client for the server.
    #[error("Connection to {server} failed: {message}")]
    ConnectFailed { server: String, message: String },

    /// Connecting took longer than the configured timeout.
    #[error("Connection to {server} timed out after {secs} seconds")]
    Timeout { server: String, secs: u64 },

    /// The server answered with an error.
    #[error("RPC to {server} failed: {message}")]
    Rpc { server: String, message: String },

    /// The server does not know the requested object.
    #[error("{entity} not found on network server: {id}")]
    RemoteNotFound { entity: String, id: String },

    // =========================================================================
    // Local Errors
    // =========================================================================
    #[error(transparent)]
    Database(#[from] DbError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<std::io::Error> for NsError {
    fn from(err: std::io::Error) -> Self {
        NsError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for NsError {
    fn from(err: toml::de::Error) -> Self {
        NsError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for NsError {
    fn from(err: toml::ser::Error) -> Self {
        NsError::ConfigSaveFailed(err.to_string())
    }
}

impl NsError {
    pub fn rpc(server: impl Into<String>, message: impl ToString) -> Self {
        NsError::Rpc {
            server: server.into(),
            message: message.to_string(),
        }
    }

    /// Control-flow classification, aligned with [`DbError::kind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            NsError::Database(err) => err.kind(),
            NsError::RemoteNotFound { .. } => ErrorKind::NotFound,
            NsError::Validation(_) | NsError::InvalidConfig(_) => ErrorKind::Invalid,
            NsError::ConfigLoadFailed(_)
            | NsError::ConfigSaveFailed(_)
            | NsError::ConnectFailed { .. }
            | NsError::Timeout { .. }
            | NsError::Rpc { .. } => ErrorKind::Infrastructure,
        }
    }

    /// True for transport failures worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NsError::ConnectFailed { .. } | NsError::Timeout { .. } | NsError::Rpc { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_forwards_database_errors() {
        let err: NsError = DbError::not_found("MulticastGroup", "x").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: NsError = DbError::duplicate("multicast_group.id", "x").into();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(NsError::Timeout {
            server: "ns:8000".into(),
            secs: 5
        }
        .is_retryable());
        assert!(NsError::rpc("ns:8000", "unavailable").is_retryable());
        assert!(!NsError::InvalidConfig("bad".into()).is_retryable());
        assert_eq!(
            NsError::RemoteNotFound {
                entity: "MulticastGroup".into(),
                id: "x".into()
            }
            .kind(),
            ErrorKind::NotFound
        );
    }
}
