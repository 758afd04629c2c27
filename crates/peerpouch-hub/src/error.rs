//! Hub-level error types.

use peerpouch_types::error::{DbError, PeerPouchError};
use peerpouch_wire::{TransportError, WireError};
use thiserror::Error;

/// Error type for share management and remote database access.
#[derive(Error, Debug)]
pub enum HubError {
    /// A wrapped PeerPouchError.
    #[error(transparent)]
    PeerPouch(#[from] PeerPouchError),

    /// The link or RPC layer failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The peer transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A database operation was answered with an error.
    #[error(transparent)]
    Db(#[from] DbError),
}

impl HubError {
    /// The error as a database-level result, for reporting through callbacks.
    pub fn to_db_error(&self) -> DbError {
        match self {
            HubError::Db(e) => e.clone(),
            HubError::PeerPouch(PeerPouchError::Conflict(_)) => DbError::conflict(),
            HubError::PeerPouch(PeerPouchError::NotFound(id)) => {
                DbError::not_found(format!("missing: {id}"))
            }
            HubError::Wire(WireError::Closed) => DbError::link_closed(),
            other => DbError::new(500, "internal_error", other.to_string()),
        }
    }
}

/// Alias for hub results.
pub type HubResult<T> = Result<T, HubError>;
