//! Shared error types for PeerPouch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for hub records and share bookkeeping.
#[derive(Error, Debug)]
pub enum PeerPouchError {
    /// A record was written against a stale or missing revision.
    #[error("Document update conflict: {0}")]
    Conflict(String),

    /// The requested record does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// A record does not have the shape its `type` promises.
    #[error("Invalid document '{id}': {reason}")]
    InvalidDocument {
        /// Record id.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// `unshare` was called for a database that has no active share.
    #[error("Database is not currently shared")]
    NotShared,

    /// `share` was called twice for the same database.
    #[error("Database is already shared as {0}")]
    AlreadyShared(String),

    /// The share directory has no entry under this name.
    #[error("Unknown PeerPouch share dbname: {0}")]
    UnknownShare(String),

    /// The relay hub rejected or failed an operation.
    #[error("Hub error: {0}")]
    Hub(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with PeerPouchError.
pub type PeerPouchResult<T> = Result<T, PeerPouchError>;

/// Database-level error as it travels inside callback arguments.
///
/// Serializes to `{"status": 403, "error": "forbidden", "reason": "..."}` so
/// either side of a link can report it to its caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{error} ({status}): {reason}")]
pub struct DbError {
    /// HTTP-like status code.
    pub status: u16,
    /// Short machine-readable name.
    pub error: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl DbError {
    /// Build an error from its parts.
    pub fn new(status: u16, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            reason: reason.into(),
        }
    }

    /// The request was refused by policy (e.g. destroying a peer's database).
    pub fn forbidden() -> Self {
        Self::new(403, "forbidden", "The request was refused")
    }

    /// The remote side does not provide this operation.
    pub fn not_implemented() -> Self {
        Self::new(501, "not_implemented", "Unable to fulfill the request")
    }

    /// A document or attachment is missing.
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(404, "not_found", reason)
    }

    /// A write raced with another write.
    pub fn conflict() -> Self {
        Self::new(409, "conflict", "Document update conflict")
    }

    /// The arguments did not make sense.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(400, "bad_request", reason)
    }

    /// The link to the remote database went away before it answered.
    pub fn link_closed() -> Self {
        Self::new(503, "link_closed", "Peer connection closed before replying")
    }

    /// Convert an arbitrary JSON error value received from a peer.
    ///
    /// Peers are untrusted, so anything that is not a well-formed error object
    /// is reported as an opaque 500.
    pub fn from_remote(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone())
            .unwrap_or_else(|_| Self::new(500, "unknown_error", value.to_string()))
    }
}
