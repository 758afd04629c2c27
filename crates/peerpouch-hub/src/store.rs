//! Signal relay store contract.
//!
//! The hub is any document store that can create, update and soft-delete
//! records, list them, report its current feed position and stream changes
//! from a given position. PeerPouch only ever writes signal and share records
//! to it.

use crate::error::HubResult;
use async_trait::async_trait;
use peerpouch_types::record::{Change, HubDocument};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostResponse {
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

/// Hub summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubInfo {
    pub db_name: String,
    /// Current feed position.
    pub update_seq: u64,
    /// Live (non-deleted) records.
    pub doc_count: usize,
}

/// A continuous change feed. Dropping the receiver cancels it.
pub type ChangeFeed = mpsc::UnboundedReceiver<Change>;

/// The relay store PeerPouch signals through.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Stable identity of this hub, used to name discovered shares.
    fn id(&self) -> &str;

    /// Create, update or soft-delete a record.
    ///
    /// Updating or deleting an existing record requires its current `_rev`;
    /// a stale revision is a conflict.
    async fn post(&self, doc: HubDocument) -> HubResult<PostResponse>;

    /// Every live record, with bodies.
    async fn all_docs(&self) -> HubResult<Vec<HubDocument>>;

    async fn info(&self) -> HubResult<HubInfo>;

    /// Changes after `since`, then every later change as it happens.
    async fn changes(&self, since: u64) -> HubResult<ChangeFeed>;
}
