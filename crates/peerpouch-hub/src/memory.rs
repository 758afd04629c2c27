//! In-memory relay store.

use crate::error::HubResult;
use crate::store::{ChangeFeed, HubInfo, PostResponse, RelayStore};
use async_trait::async_trait;
use peerpouch_types::error::PeerPouchError;
use peerpouch_types::record::{Change, HubDocument};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A relay store living in this process.
///
/// Revisions are `<generation>-<uuid>`. The change feed reports the latest
/// change per record, like a CouchDB feed.
pub struct MemoryHub {
    id: String,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    docs: HashMap<String, HubDocument>,
    /// Latest change seq for each record.
    by_seq: BTreeMap<u64, String>,
    seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<Change>>,
}

impl MemoryHub {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(HubState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current version of a record, tombstones included.
    pub fn get(&self, id: &str) -> Option<HubDocument> {
        self.lock().docs.get(id).cloned()
    }

    /// Open change feeds.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Live records of the given `type`.
    pub fn count_of_type(&self, doc_type: &str) -> usize {
        self.lock()
            .docs
            .values()
            .filter(|doc| !doc.deleted && doc.doc_type() == Some(doc_type))
            .count()
    }
}

fn generation(rev: &str) -> u64 {
    rev.split('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl RelayStore for MemoryHub {
    fn id(&self) -> &str {
        &self.id
    }

    async fn post(&self, mut doc: HubDocument) -> HubResult<PostResponse> {
        if doc.id.is_empty() {
            doc.id = Uuid::new_v4().to_string();
        }
        let mut state = self.lock();

        let next_gen = match state.docs.get(&doc.id) {
            Some(existing) => {
                let live_without_rev = doc.rev.is_none() && !existing.deleted;
                let stale = doc.rev.is_some() && doc.rev != existing.rev;
                if live_without_rev || stale {
                    return Err(PeerPouchError::Conflict(doc.id).into());
                }
                existing.rev.as_deref().map(generation).unwrap_or(0) + 1
            }
            None if doc.deleted || doc.rev.is_some() => {
                return Err(PeerPouchError::NotFound(doc.id).into());
            }
            None => 1,
        };

        let rev = format!("{next_gen}-{}", Uuid::new_v4().simple());
        doc.rev = Some(rev.clone());
        if doc.deleted {
            doc.body.clear();
        }

        state.seq += 1;
        let seq = state.seq;
        state.by_seq.retain(|_, id| *id != doc.id);
        state.by_seq.insert(seq, doc.id.clone());
        state.docs.insert(doc.id.clone(), doc.clone());

        let change = Change {
            seq,
            id: doc.id.clone(),
            deleted: doc.deleted,
            doc: doc.clone(),
        };
        state
            .subscribers
            .retain(|tx| tx.send(change.clone()).is_ok());
        debug!(hub = %self.id, id = %doc.id, seq, deleted = doc.deleted, "Stored record");

        Ok(PostResponse {
            ok: true,
            id: doc.id,
            rev,
        })
    }

    async fn all_docs(&self) -> HubResult<Vec<HubDocument>> {
        let state = self.lock();
        let mut docs: Vec<HubDocument> = state
            .docs
            .values()
            .filter(|doc| !doc.deleted)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn info(&self) -> HubResult<HubInfo> {
        let state = self.lock();
        Ok(HubInfo {
            db_name: self.id.clone(),
            update_seq: state.seq,
            doc_count: state.docs.values().filter(|doc| !doc.deleted).count(),
        })
    }

    async fn changes(&self, since: u64) -> HubResult<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for (seq, id) in state.by_seq.range(since + 1..) {
            if let Some(doc) = state.docs.get(id) {
                let _ = tx.send(Change {
                    seq: *seq,
                    id: id.clone(),
                    deleted: doc.deleted,
                    doc: doc.clone(),
                });
            }
        }
        state.subscribers.push(tx);
        Ok(rx)
    }
}
