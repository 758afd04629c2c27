//! Records exchanged through the relay hub.
//!
//! The hub is a plain document store. Every record carries `_id`, an optional
//! `_rev` and an optional `_deleted` marker; the rest of the body is free-form
//! JSON whose `type` field says what the record is for. Signals and share
//! announcements are the two record kinds PeerPouch writes.

use crate::error::{PeerPouchError, PeerPouchResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `type` of a connection-setup signal record.
pub const SIGNAL_TYPE: &str = "com.stemstorage.peerpouch.signal";

/// `type` of a share announcement record.
pub const SHARE_TYPE: &str = "com.stemstorage.peerpouch.share";

/// `type` reserved for presence records. Nothing writes these yet.
pub const PRESENCE_TYPE: &str = "com.stemstorage.peerpouch.presence";

fn is_false(b: &bool) -> bool {
    !*b
}

/// A raw record as stored on the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubDocument {
    /// Record id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Current revision; `None` for a record that was never written.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Soft-delete marker.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Everything else.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl HubDocument {
    /// A new, never-written record with the given body.
    pub fn new(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            body,
        }
    }

    /// The soft-delete form of an existing record.
    pub fn tombstone(id: impl Into<String>, rev: Option<String>) -> Self {
        Self {
            id: id.into(),
            rev,
            deleted: true,
            body: Map::new(),
        }
    }

    /// The record's declared `type`, if any.
    pub fn doc_type(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    fn string_field(&self, field: &str) -> PeerPouchResult<String> {
        self.body
            .get(field)
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| PeerPouchError::InvalidDocument {
                id: self.id.clone(),
                reason: format!("missing string field '{field}'"),
            })
    }

    fn expect_type(&self, expected: &str) -> PeerPouchResult<()> {
        match self.doc_type() {
            Some(t) if t == expected => Ok(()),
            other => Err(PeerPouchError::InvalidDocument {
                id: self.id.clone(),
                reason: format!("expected type '{expected}', found {other:?}"),
            }),
        }
    }
}

/// One entry of the hub's change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Feed position of this change.
    pub seq: u64,
    /// Id of the changed record.
    pub id: String,
    /// Whether the change was a soft delete.
    pub deleted: bool,
    /// The record as of this change.
    pub doc: HubDocument,
}

/// A connection-setup message relayed between two peers.
///
/// `data` is opaque to the hub; the receiving link decides what it is.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    /// Record id (`p-signal-…` from a requester, `s-signal-…` from a share).
    pub id: String,
    /// Revision, present once the record came back from the hub.
    pub rev: Option<String>,
    /// Identity of the sending endpoint.
    pub sender: String,
    /// Identity of the receiving endpoint.
    pub recipient: String,
    /// Negotiation payload.
    pub data: Value,
    /// Pass-through metadata for the application handshake.
    pub info: Value,
}

impl SignalEnvelope {
    /// Create a new envelope ready to post.
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        data: Value,
        info: Value,
    ) -> Self {
        Self {
            id: id.into(),
            rev: None,
            sender: sender.into(),
            recipient: recipient.into(),
            data,
            info,
        }
    }

    /// Parse a hub record. Fails unless it is a live signal record.
    pub fn from_document(doc: &HubDocument) -> PeerPouchResult<Self> {
        doc.expect_type(SIGNAL_TYPE)?;
        Ok(Self {
            id: doc.id.clone(),
            rev: doc.rev.clone(),
            sender: doc.string_field("sender")?,
            recipient: doc.string_field("recipient")?,
            data: doc.body.get("data").cloned().unwrap_or(Value::Null),
            info: doc.body.get("info").cloned().unwrap_or(Value::Null),
        })
    }

    /// Hub representation.
    pub fn to_document(&self) -> HubDocument {
        let mut body = Map::new();
        body.insert("type".into(), Value::String(SIGNAL_TYPE.into()));
        body.insert("sender".into(), Value::String(self.sender.clone()));
        body.insert("recipient".into(), Value::String(self.recipient.clone()));
        body.insert("data".into(), self.data.clone());
        body.insert("info".into(), self.info.clone());
        HubDocument {
            id: self.id.clone(),
            rev: self.rev.clone(),
            deleted: false,
            body,
        }
    }

    /// True when this envelope travels between exactly these two endpoints.
    pub fn is_between(&self, sender: &str, recipient: &str) -> bool {
        self.sender == sender && self.recipient == recipient
    }
}

/// An announcement that a local database can be requested by remote peers.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareRecord {
    /// Record id (`share-…`); doubles as the share's peer identity.
    pub id: String,
    /// Revision, filled in after the record was posted.
    pub rev: Option<String>,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Free-form metadata shown to requesters and echoed in signals.
    pub info: Value,
    /// Set when the announcement was withdrawn.
    pub deleted: bool,
}

impl ShareRecord {
    /// A fresh, unposted announcement.
    pub fn new(id: impl Into<String>, name: Option<String>, info: Value) -> Self {
        Self {
            id: id.into(),
            rev: None,
            name,
            info,
            deleted: false,
        }
    }

    /// Parse a hub record.
    ///
    /// Withdrawn announcements carry no body on the hub, so a deleted record is
    /// accepted without a `type`.
    pub fn from_document(doc: &HubDocument) -> PeerPouchResult<Self> {
        if !doc.deleted {
            doc.expect_type(SHARE_TYPE)?;
        }
        Ok(Self {
            id: doc.id.clone(),
            rev: doc.rev.clone(),
            name: doc.body.get("name").and_then(Value::as_str).map(String::from),
            info: doc.body.get("info").cloned().unwrap_or(Value::Null),
            deleted: doc.deleted,
        })
    }

    /// Hub representation.
    pub fn to_document(&self) -> HubDocument {
        let mut body = Map::new();
        body.insert("type".into(), Value::String(SHARE_TYPE.into()));
        body.insert(
            "name".into(),
            self.name.clone().map(Value::String).unwrap_or(Value::Null),
        );
        body.insert("info".into(), self.info.clone());
        HubDocument {
            id: self.id.clone(),
            rev: self.rev.clone(),
            deleted: self.deleted,
            body,
        }
    }
}
