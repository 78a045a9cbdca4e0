//! Error types for the ingestion daemon.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core type error.
    #[error(transparent)]
    Core(#[from] quill_core::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A single event failed to decode; the stream itself is fine.
    #[error("decode error: {0}")]
    Decode(String),

    /// Transient gateway error (connection drop, timeout). Retried.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// The gateway rejected our credentials. Not retried.
    #[error("gateway authentication rejected: {0}")]
    Auth(String),

    /// Reconnection failed too many times in a row.
    #[error("gateway reconnect failed {0} consecutive times")]
    ReconnectExhausted(u32),

    /// Transient index failure (rate limit, timeout, 5xx). Retried.
    #[error("index transient failure: {0}")]
    IndexTransient(String),

    /// Permanent index failure for a whole request (malformed request).
    #[error("index permanent failure: {0}")]
    IndexPermanent(String),

    /// Fatal index failure (bad credentials, index does not exist).
    #[error("index fatal failure: {0}")]
    IndexFatal(String),

    /// A pipeline channel closed unexpectedly.
    #[error("pipeline channel closed")]
    ChannelClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error should abort the process rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::ReconnectExhausted(_) | Error::IndexFatal(_)
        )
    }

    /// Whether this error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Gateway(_) | Error::IndexTransient(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(_) => true,
            _ => false,
        }
    }
}
