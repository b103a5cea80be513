//! Typed error hierarchy for fragpull
//!
//! The taxonomy mirrors the service boundaries: validation errors surface
//! synchronously at the API, fetch errors are retried by the engine, storage
//! errors are terminal for the resource that hit them.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download service
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied invariant violated; maps to HTTP 400
    #[error("validation failed for '{field}': {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// Resource id unknown; maps to HTTP 404
    #[error("download not found: {0}")]
    NotFound(String),

    /// Concurrency cap hit; maps to HTTP 429
    #[error("too many concurrent downloads (limit: {limit})")]
    Busy { limit: usize },

    /// Transport failure during a fragment fetch
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Local filesystem failure during init/merge/manifest
    #[error("io error at {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    /// Persistence failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Event publication failure; recorded, never fatal
    #[error("event publish failed: {0}")]
    Event(String),

    /// Service is shutting down and no longer admits downloads
    #[error("service is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure kinds surfaced by the transport client
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request could not be constructed
    #[error("error creating request: {0}")]
    RequestBuild(String),

    /// Connection, DNS, TLS, timeout or redirect failure
    #[error("error downloading: {0}")]
    Transport(String),

    /// Response status was not 200 or 206
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Body read failed mid-stream
    #[error("error reading: {0}")]
    Read(String),

    /// Sink write failed
    #[error("error writing: {0}")]
    Write(String),

    /// The per-download context was cancelled
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Cancellation is cooperative, not a fault of the origin
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fetch(f) if f.is_cancelled())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::RequestBuild(err.to_string())
        } else if let Some(status) = err.status() {
            Self::UnexpectedStatus(status.as_u16())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("codec: {}", err))
    }
}
