//! Error types for the loggest runner

use thiserror::Error;

/// Result type alias using the loggest Error
pub type Result<T> = std::result::Result<T, Error>;

/// Loggest runner error types
///
/// Only configuration errors are fatal; everything else degrades to
/// "recorded and continue" at the call site.
#[derive(Error, Debug)]
pub enum Error {
    #[error("test name is required (--test-name <file>)")]
    MissingTestName,

    #[error("permission grant failed for {origin}: {reason}")]
    PermissionGrant { origin: String, reason: String },

    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("context error: {0}")]
    Context(String),

    #[error("control proxy operation not exposed: {0}")]
    ControlOpDenied(String),

    #[error("control proxy error: {0}")]
    ControlProxy(String),

    #[error("bridge protocol error: {0}")]
    Bridge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the fatal configuration category: errors that must be
    /// reported before any execution context exists.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MissingTestName | Error::PermissionGrant { .. } | Error::Navigation { .. }
        )
    }
}
