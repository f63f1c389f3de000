//! Error types for the sync layer.
//!
//! Fetch failures are transient (retried, then parked on the cache entry with
//! last-known-good data retained); mutation failures always surface to the
//! caller; channel failures only degrade freshness.

use thiserror::Error;

use appraise_api::ApiError;

/// A read-path failure: network, timeout, or non-success status.
///
/// Stored on cache entries as `Arc<FetchError>` once retries are exhausted;
/// the cached data is never cleared by a failed revalidation.
#[derive(Debug, Error)]
#[error("fetch failed: {0}")]
pub struct FetchError(#[from] pub ApiError);

/// A write-path failure. Never retried automatically.
#[derive(Debug, Error)]
#[error("mutation rejected: {0}")]
pub struct MutationError(#[from] pub ApiError);

/// Push channel failures. Drive the reconnect state machine; never raised to
/// read-path callers.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Could not establish the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The established connection failed mid-stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single inbound payload could not be decoded. The payload is dropped;
    /// the channel stays up.
    #[error("malformed push payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Reconnect attempts exhausted; the channel is terminally offline.
    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },
}
