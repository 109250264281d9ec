//! Error types for leadsync-core operations.
//!
//! `SyncError` is what the network and storage layers return. Background loops
//! swallow it (logged, never shown); user-initiated operations convert it into a
//! [`UserNotice`](crate::notice::UserNotice) before it reaches the host UI.

use std::path::PathBuf;

/// All errors that can occur in leadsync-core operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Network Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Push channel closed by server")]
    StreamClosed,

    #[error("No auth token available")]
    AuthUnavailable,

    #[error("Invalid API URL {url}: {details}")]
    InvalidUrl { url: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        SyncError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;
