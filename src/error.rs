//! Error types for corebus.
//!
//! Registration and lifecycle failures are returned as typed errors. Rule
//! parsing only fails hard when the document itself is unreadable; malformed
//! pieces inside a valid document are logged and dropped by the parser.

use thiserror::Error;

/// Errors raised by the event hub and its extension containers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Extension name '{name}' is already registered")]
    DuplicateExtensionName {
        name: String,
    },

    #[error("Extension name cannot be empty")]
    InvalidExtensionName,

    #[error("Extension '{name}' is not registered")]
    ExtensionNotRegistered {
        name: String,
    },

    #[error("Extension '{name}' failed to initialize")]
    ExtensionInitializationFailure {
        name: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

/// Errors raised while reading rule documents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RulesError {
    #[error("Rules document is not valid JSON: {message}")]
    InvalidJson {
        message: String,
    },

    #[error("Invalid rule: {reason}")]
    InvalidRule {
        reason: String,
    },
}

/// Top-level error type for corebus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    #[error("Rules error: {0}")]
    Rules(#[from] RulesError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CoreError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_hub(&self) -> bool {
        matches!(self, Self::Hub(_))
    }

    #[must_use]
    pub const fn is_rules(&self) -> bool {
        matches!(self, Self::Rules(_))
    }

    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if waiting again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Hub(HubError::Timeout { .. }))
    }
}

/// Result type alias for corebus operations.
pub type CoreResult<T> = Result<T, CoreError>;
