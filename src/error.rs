//! Error types for the storage backend plugin layer
//!
//! Provides structured error types for plugin registration, array sessions,
//! HyperMetro dispatch and attach/detach strategy execution.

use crate::domain::ArraySide;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the plugin layer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Invalid capacity {capacity} bytes: must be a positive multiple of {unit} bytes")]
    InvalidCapacity { capacity: i64, unit: u64 },

    // =========================================================================
    // Registry & Topology Errors
    // =========================================================================
    #[error("Plugin already registered: {name}")]
    PluginAlreadyRegistered { name: String },

    #[error("Plugin not registered: {name}")]
    PluginNotRegistered { name: String },

    #[error("Backend not found: {backend}")]
    BackendNotFound { backend: String },

    #[error("Backend already registered: {backend}")]
    BackendAlreadyRegistered { backend: String },

    #[error("Backend {backend} is already bonded to {existing}")]
    AlreadyBonded { backend: String, existing: String },

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    #[error("Login to backend {backend} failed: {reason}")]
    Login { backend: String, reason: String },

    #[error("Authentication against backend {backend} failed: {reason}")]
    Authentication { backend: String, reason: String },

    #[error("Transport error talking to backend {backend}: {reason}")]
    Transport { backend: String, reason: String },

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Both local storage {local} and remote storage {remote} are unavailable")]
    BothArraysUnavailable { local: String, remote: String },

    // =========================================================================
    // Array Object Errors
    // =========================================================================
    #[error("Volume {volume} not found on backend {backend}")]
    VolumeNotFound { backend: String, volume: String },

    #[error("Storage pool {pool} not found on backend {backend}")]
    PoolNotFound { backend: String, pool: String },

    #[error("Operation {operation} not supported by backend {backend}")]
    NotSupported { backend: String, operation: String },

    // =========================================================================
    // HyperMetro Errors
    // =========================================================================
    #[error("HyperMetro pair of volume {volume} (id {volume_id}) doesn't exist on backend {backend}")]
    MetroPairMissing {
        backend: String,
        volume: String,
        volume_id: String,
    },

    #[error("HyperMetro {side} side of volume {volume} failed: {source}")]
    MetroPartialFailure {
        volume: String,
        side: ArraySide,
        #[source]
        source: Box<Error>,
    },

    #[error("HyperMetro volume {volume} failed on both sides: local: {local}; remote: {remote}")]
    MetroBothSidesFailed {
        volume: String,
        #[source]
        local: Box<Error>,
        remote: Box<Error>,
    },

    // =========================================================================
    // Operation Errors
    // =========================================================================
    #[error("{operation} of volume {volume} on backend {backend} failed: {source}")]
    Operation {
        backend: String,
        operation: String,
        volume: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{operation} of volume {volume} on backend {backend} failed: {reason}")]
    OperationFailed {
        backend: String,
        operation: String,
        volume: String,
        reason: String,
    },

    #[error("Request cancelled during {operation}")]
    Cancelled { operation: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration or parameters; retrying won't help
    Configuration,
    /// Login/logout or transport failure; self-heals on a later call
    Connectivity,
    /// Declared relationship without its array-side counterpart
    Consistency,
    /// One side of a HyperMetro operation failed
    PartialFailure,
    /// Both sides of a replicated volume are unreachable
    Unavailable,
    /// Object does not exist
    NotFound,
    /// Operation not offered by this backend family
    Unsupported,
    /// Request cancelled or timed out
    Aborted,
    /// Anything else
    Internal,
}

impl Error {
    /// Wrap an error with the operation, volume and backend it happened in
    pub fn operation(
        backend: impl Into<String>,
        operation: impl Into<String>,
        volume: impl Into<String>,
        source: Error,
    ) -> Self {
        Error::Operation {
            backend: backend.into(),
            operation: operation.into(),
            volume: volume.into(),
            source: Box::new(source),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Operation { source, .. } => source.kind(),
            Error::MetroPartialFailure { .. } => ErrorKind::PartialFailure,
            Error::MetroBothSidesFailed { local, remote, .. } => {
                if local.is_transient() && remote.is_transient() {
                    ErrorKind::Unavailable
                } else {
                    local.kind()
                }
            }

            Error::Configuration(_)
            | Error::InvalidParameter { .. }
            | Error::InvalidCapacity { .. }
            | Error::PluginAlreadyRegistered { .. }
            | Error::PluginNotRegistered { .. }
            | Error::BackendAlreadyRegistered { .. }
            | Error::AlreadyBonded { .. }
            | Error::YamlParse(_) => ErrorKind::Configuration,

            Error::Login { .. }
            | Error::Authentication { .. }
            | Error::Transport { .. }
            | Error::BackendUnavailable { .. } => ErrorKind::Connectivity,

            Error::BothArraysUnavailable { .. } => ErrorKind::Unavailable,
            Error::MetroPairMissing { .. } => ErrorKind::Consistency,

            Error::VolumeNotFound { .. }
            | Error::PoolNotFound { .. }
            | Error::BackendNotFound { .. } => ErrorKind::NotFound,

            Error::NotSupported { .. } => ErrorKind::Unsupported,
            Error::Cancelled { .. } | Error::Timeout { .. } => ErrorKind::Aborted,

            Error::Internal(_) | Error::OperationFailed { .. } | Error::JsonParse(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if a later retry of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connectivity
                | ErrorKind::Unavailable
                | ErrorKind::PartialFailure
                | ErrorKind::Aborted
                | ErrorKind::Internal
        )
    }

    /// Check if this error is transient (array reachability)
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connectivity | ErrorKind::Unavailable)
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result type alias for the plugin layer
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::Login {
            backend: "san-a".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.is_transient());
        assert!(err.is_retryable());

        let err = Error::Configuration("bad protocol".into());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());

        let err = Error::MetroPairMissing {
            backend: "san-a".into(),
            volume: "pvc-1".into(),
            volume_id: "17".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unavailable_is_distinct_from_not_found() {
        let unavailable = Error::BothArraysUnavailable {
            local: "san-a".into(),
            remote: "san-b".into(),
        };
        let missing = Error::VolumeNotFound {
            backend: "san-a".into(),
            volume: "pvc-1".into(),
        };
        assert_eq!(unavailable.kind(), ErrorKind::Unavailable);
        assert!(!unavailable.is_not_found());
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_operation_wrapper_keeps_context_and_kind() {
        let err = Error::operation(
            "san-a",
            "attach",
            "pvc-1",
            Error::MetroPartialFailure {
                volume: "pvc-1".into(),
                side: ArraySide::Remote,
                source: Box::new(Error::Transport {
                    backend: "san-b".into(),
                    reason: "reset".into(),
                }),
            },
        );
        let message = err.to_string();
        assert!(message.contains("attach"));
        assert!(message.contains("pvc-1"));
        assert!(message.contains("san-a"));
        assert_eq!(err.kind(), ErrorKind::PartialFailure);
    }
}
