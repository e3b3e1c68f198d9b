//! Unified error types for the lxtask workspace.
//!
//! The variants follow the supervision error taxonomy: validation errors
//! are raised before any container exists, runtime errors come from the
//! native container tooling, recoverable errors mark failures the caller
//! may retry elsewhere, and observation errors come from liveness probing.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum LxtaskError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A task or driver configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Validation {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A native runtime operation failed.
    #[error("{operation} failed: {message}")]
    Runtime {
        /// Name of the native operation.
        operation: &'static str,
        /// Description of the failure, usually the tool's stderr.
        message: String,
    },

    /// A failure the caller may retry, possibly on another host.
    #[error("recoverable error: {message}")]
    Recoverable {
        /// Description of the failure.
        message: String,
    },

    /// Looking up or probing a container process failed.
    #[error("cannot observe process {pid}: {message}")]
    Observation {
        /// Process identifier that was probed.
        pid: i32,
        /// Description of the failure.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identifier already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the duplicated resource.
        kind: &'static str,
        /// Identifier of the duplicated resource.
        id: String,
    },

    /// The task is not in a state that allows the operation.
    #[error("task {id}: {message}")]
    InvalidState {
        /// Task identifier.
        id: String,
        /// Why the operation was refused.
        message: String,
    },

    /// The operation is not supported by this driver.
    #[error("{operation} is not supported by the lxc driver")]
    Unsupported {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl LxtaskError {
    /// Builds a [`LxtaskError::Validation`] from any displayable message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Builds a [`LxtaskError::NotFound`] for a task identifier.
    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    /// Returns whether the caller may retry the failed operation.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable { .. })
    }

    /// Returns whether the error reports an unregistered resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns whether the error was raised by boundary validation.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, LxtaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_recoverable_variant_is_recoverable() {
        let err = LxtaskError::Recoverable {
            message: "rootfs download failed".into(),
        };
        assert!(err.is_recoverable());
        assert!(!LxtaskError::validation("bad").is_recoverable());
    }

    #[test]
    fn task_not_found_names_the_task() {
        let err = LxtaskError::task_not_found("web-1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "task not found: web-1");
    }

    #[test]
    fn unsupported_message_mentions_driver() {
        let err = LxtaskError::Unsupported {
            operation: "signal delivery",
        };
        assert_eq!(
            err.to_string(),
            "signal delivery is not supported by the lxc driver"
        );
    }
}
