//! Error types for the record API client.

use thiserror::Error;

/// Errors that can occur when talking to the records backend.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed (connection, TLS, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server responded with a non-success status.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configured base URL could not be parsed.
    #[error("invalid base URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether this error came from a request timeout.
    ///
    /// Timeouts are handled identically to other transport failures by the
    /// retry logic upstream; this is exposed for logging only.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Http(e) if e.is_timeout())
    }
}
