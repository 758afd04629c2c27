//! Errors from the link and RPC layers.

use crate::transport::TransportError;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection exists, but data channel is not open")]
    NotConnected,
    #[error("Link closed")]
    Closed,
    #[error("Malformed call envelope: {0}")]
    Codec(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Invocation failed: {0}")]
    Invocation(String),
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;
