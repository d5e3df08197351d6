//! Transport error types.

use thiserror::Error;

/// Sending over the session failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Session has shut down")]
    Shutdown,
    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("WebSocket error: {0}")]
    Socket(String),
}

/// A correlated request did not produce a response.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Request {id} timed out after {timeout_ms} ms")]
    Timeout { id: String, timeout_ms: u64 },
    #[error("Connection lost before a response arrived")]
    ConnectionLost,
}
