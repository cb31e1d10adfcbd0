//! Error types for bulkresearch.
//!
//! Library crates use [`BulkResearchError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-entity failures are *data* (`ResultRecord::error`) and never pass
//! through this type; only systemic failures do.

use std::path::PathBuf;

/// Top-level error type for all bulkresearch operations.
#[derive(Debug, thiserror::Error)]
pub enum BulkResearchError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Required credentials are absent; the whole window cannot proceed.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Network/HTTP transport error.
    #[error("network error: {0}")]
    Network(String),

    /// Response or input parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad entity line, fingerprint mismatch, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BulkResearchError>;

impl BulkResearchError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the batch as a whole cannot proceed.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Credentials(_) | Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = BulkResearchError::config("missing endpoint url");
        assert_eq!(err.to_string(), "config error: missing endpoint url");

        let err = BulkResearchError::validation("line 3: empty identifier");
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn credentials_are_systemic() {
        assert!(BulkResearchError::Credentials("no key".into()).is_systemic());
        assert!(!BulkResearchError::Network("timeout".into()).is_systemic());
    }
}
