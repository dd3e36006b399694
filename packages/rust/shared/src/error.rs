//! Error types for the event catalog.
//!
//! Library crates use [`CatalogError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! `NoEvent` and ambiguous merges are deliberately absent: both are valid
//! outcomes of assembly, not failures.

use std::path::PathBuf;

/// Top-level error type for all event catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside the classified collaborator failures.
    #[error("network error: {0}")]
    Network(String),

    /// A search provider failed in a way that may succeed on retry.
    #[error("transient provider error ({provider}): {message}")]
    TransientProvider { provider: String, message: String },

    /// Every configured search provider failed; no forward progress is possible.
    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    /// A page could not be fetched; the unit of work is skipped.
    #[error("content unavailable at {url}: {reason}")]
    ContentUnavailable { url: String, reason: String },

    /// The extraction oracle is down; fatal to the run.
    #[error("extraction oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// A write would have broken a uniqueness invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Response or content parsing error.
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

    /// Data validation error (bad URL, missing identity fields, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CatalogError>;

impl CatalogError {
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

    /// Create a content-unavailable error for a URL.
    pub fn content_unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContentUnavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort the whole run rather than a single unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SearchUnavailable(_) | Self::OracleUnavailable(_))
    }
}
