//! Requester-side view of a shared database.
//!
//! A [`PeerDatabase`] wraps the method table a share bootstrapped over the
//! link. Every call sends its arguments plus a one-shot reply callback and
//! waits for that callback to fire. If the link goes away first the reply
//! callback is dropped with the RPC table and the call fails with
//! `link_closed`.

use crate::database::{
    callback_result, method, ChangeListener, ChangesHandle, ChangesOptions, Database, DbResult,
};
use crate::directory::ShareDirectory;
use crate::error::HubResult;
use crate::share::ConnectOptions;
use crate::watch::Watcher;
use async_trait::async_trait;
use bytes::Bytes;
use peerpouch_types::error::{DbError, PeerPouchError};
use peerpouch_wire::{Function, LinkState, PeerLink, RpcHandler, RpcValue};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The live connection behind a [`PeerDatabase`].
pub struct PeerSession {
    link: PeerLink,
    rpc: RpcHandler,
    watcher: Watcher,
}

impl PeerSession {
    pub(crate) fn new(link: PeerLink, rpc: RpcHandler, watcher: Watcher) -> Self {
        Self { link, rpc, watcher }
    }

    async fn shutdown(&self) {
        self.watcher.cancel();
        self.link.close().await;
    }
}

/// A remote database reached through a share.
///
/// Dropping it stops watching the hub for its signals; call
/// [`close`](Database::close) to also shut the link.
pub struct PeerDatabase {
    dbname: String,
    remote_id: Option<String>,
    api: BTreeMap<String, Function>,
    session: Option<PeerSession>,
}

#[derive(Default)]
struct FeedCancel {
    remote: Option<Function>,
    cancelled: bool,
}

impl PeerDatabase {
    /// Wrap a bootstrapped method table without a session of its own.
    pub fn from_api(dbname: impl Into<String>, api: &RpcValue) -> Self {
        let mut table = BTreeMap::new();
        let mut remote_id = None;
        if let Some(entries) = api.as_object() {
            for (name, entry) in entries {
                match entry {
                    RpcValue::Function(f) => {
                        table.insert(name.clone(), f.clone());
                    }
                    RpcValue::String(id) if name == method::ID => remote_id = Some(id.clone()),
                    _ => debug!(entry = %name, "Ignoring non-function api entry"),
                }
            }
        }
        Self {
            dbname: dbname.into(),
            remote_id,
            api: table,
            session: None,
        }
    }

    pub(crate) fn connected(dbname: String, api: &RpcValue, session: PeerSession) -> Self {
        let mut db = Self::from_api(dbname, api);
        db.session = Some(session);
        db
    }

    /// Connect to the share registered under `name` in `directory`.
    pub async fn open(
        directory: &ShareDirectory,
        name: &str,
        options: ConnectOptions,
    ) -> HubResult<Self> {
        let descriptor = directory
            .lookup(name)
            .ok_or_else(|| PeerPouchError::UnknownShare(name.to_string()))?;
        descriptor.connect(options).await
    }

    /// Destroying a peer's database is never allowed.
    pub async fn destroy(name: &str) -> DbResult<()> {
        tokio::task::yield_now().await;
        debug!(name, "Refusing to destroy remote database");
        Err(DbError::forbidden())
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Identity the share reported for its database.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.api.contains_key(name)
    }

    /// Link state, if this database has a link.
    pub fn state(&self) -> Option<LinkState> {
        self.session.as_ref().map(|s| s.link.state())
    }

    /// Local functions the share can still call, bootstrap entry included.
    pub fn exposed_count(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.rpc.exposed_count())
    }

    async fn invoke(&self, name: &str, mut args: Vec<RpcValue>) -> DbResult<RpcValue> {
        let Some(remote) = self.api.get(name) else {
            return Err(DbError::not_implemented());
        };
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        args.push(RpcValue::Function(Function::new(move |reply| {
            let sender = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(sender) = sender {
                let _ = sender.send(callback_result(reply));
            }
            Ok(())
        })));
        if let Err(e) = remote.call(args) {
            warn!(method = name, error = %e, "Remote call failed");
            return Err(DbError::link_closed());
        }
        rx.await.unwrap_or_else(|_| Err(DbError::link_closed()))
    }

    async fn invoke_json(&self, name: &str, args: Vec<RpcValue>) -> DbResult<Value> {
        self.invoke(name, args).await.map(|value| value.to_json())
    }
}

#[async_trait]
impl Database for PeerDatabase {
    fn id(&self) -> String {
        self.remote_id.clone().unwrap_or_else(|| self.dbname.clone())
    }

    async fn bulk_docs(&self, docs: Vec<Value>, opts: Value) -> DbResult<Value> {
        let req = RpcValue::from(json!({ "docs": docs }));
        self.invoke_json(method::BULK_DOCS, vec![req, opts.into()]).await
    }

    async fn get_revision_tree(&self, doc_id: &str) -> DbResult<Value> {
        self.invoke_json(method::GET_REVISION_TREE, vec![doc_id.into()])
            .await
    }

    async fn do_compaction(&self, doc_id: &str, rev_tree: Value, revs: Vec<String>) -> DbResult<()> {
        let revs = RpcValue::Array(revs.into_iter().map(RpcValue::from).collect());
        self.invoke(method::DO_COMPACTION, vec![doc_id.into(), rev_tree.into(), revs])
            .await
            .map(|_| ())
    }

    async fn get(&self, id: &str, opts: Value) -> DbResult<Value> {
        self.invoke_json(method::GET, vec![id.into(), opts.into()]).await
    }

    async fn get_attachment(&self, digest: &str, opts: Value) -> DbResult<Bytes> {
        match self
            .invoke(method::GET_ATTACHMENT, vec![digest.into(), opts.into()])
            .await?
        {
            RpcValue::Blob(blob) => Ok(blob.into_bytes()),
            RpcValue::String(text) => Ok(Bytes::from(text)),
            other => Err(DbError::new(
                502,
                "bad_response",
                format!("attachment arrived as {}", other.to_json()),
            )),
        }
    }

    async fn all_docs(&self, opts: Value) -> DbResult<Value> {
        self.invoke_json(method::ALL_DOCS, vec![opts.into()]).await
    }

    /// Follow the remote change feed.
    ///
    /// The handle works immediately: a cancel issued before the share has
    /// handed back its own cancel function is applied when that arrives.
    fn changes(&self, opts: ChangesOptions, listener: ChangeListener) -> ChangesHandle {
        let Some(remote) = self.api.get(method::CHANGES) else {
            warn!(db = %self.dbname, "Remote has no change feed");
            return ChangesHandle::noop();
        };

        let on_change = Function::kept(move |args| {
            listener(args.first().map(RpcValue::to_json).unwrap_or(Value::Null));
            Ok(())
        });
        let mut request = RpcValue::from(serde_json::to_value(&opts).unwrap_or(Value::Null));
        if let RpcValue::Object(fields) = &mut request {
            fields.insert("onChange".into(), RpcValue::Function(on_change.clone()));
        }

        let state = Arc::new(Mutex::new(FeedCancel::default()));
        let pending = state.clone();
        let accept_cancel = Function::new(move |args| {
            let Some(cancel) = args.into_iter().next().and_then(|arg| match arg {
                RpcValue::Function(f) => Some(f),
                _ => None,
            }) else {
                return Ok(());
            };
            let cancelled = {
                let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                if !pending.cancelled {
                    pending.remote = Some(cancel.clone());
                }
                pending.cancelled
            };
            if cancelled {
                cancel.call(vec![])?;
            }
            Ok(())
        });

        if let Err(e) = remote.call(vec![request, RpcValue::Function(accept_cancel)]) {
            warn!(db = %self.dbname, error = %e, "Couldn't start remote change feed");
        }

        ChangesHandle::new(move || {
            let remote = {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                state.cancelled = true;
                state.remote.take()
            };
            if let Some(cancel) = remote {
                if let Err(e) = cancel.call(vec![]) {
                    debug!(error = %e, "Couldn't cancel remote change feed");
                }
            }
            on_change.set_kept(false);
        })
    }

    /// Close the remote database, then the link.
    async fn close(&self) -> DbResult<()> {
        let result = self.invoke(method::CLOSE, vec![]).await.map(|_| ());
        if let Some(session) = &self.session {
            session.shutdown().await;
        }
        result
    }

    async fn info(&self) -> DbResult<Value> {
        self.invoke_json(method::INFO, vec![]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::wrapped_api;
    use crate::memory_db::MemoryDatabase;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn local_pair() -> (Arc<MemoryDatabase>, PeerDatabase) {
        let db = Arc::new(MemoryDatabase::new("db1"));
        let api = wrapped_api(db.clone());
        (db, PeerDatabase::from_api("webrtc://hub/share-1", &api))
    }

    #[tokio::test]
    async fn test_calls_through_table() {
        let (_db, peer) = local_pair();
        assert_eq!(peer.id(), "db1");
        assert_eq!(peer.state(), None);

        let res = peer
            .bulk_docs(vec![json!({"_id": "a", "x": 1})], json!({}))
            .await
            .unwrap();
        assert_eq!(res[0]["ok"], json!(true));
        assert_eq!(peer.get("a", json!({})).await.unwrap()["x"], json!(1));
        assert_eq!(peer.info().await.unwrap()["doc_count"], json!(1));
        assert_eq!(peer.get("zz", json!({})).await.unwrap_err().status, 404);
    }

    #[tokio::test]
    async fn test_missing_method_is_not_implemented() {
        let api = RpcValue::object([("_id", RpcValue::from("db1"))]);
        let peer = PeerDatabase::from_api("x", &api);
        assert!(!peer.has_method(method::INFO));
        assert_eq!(peer.info().await.unwrap_err(), DbError::not_implemented());
        assert_eq!(
            peer.all_docs(json!({})).await.unwrap_err().status,
            501
        );
    }

    #[tokio::test]
    async fn test_attachment_arrives_as_bytes() {
        let (db, peer) = local_pair();
        let digest = db.put_attachment(Bytes::from_static(b"\x00\x01binary"));
        let body = peer.get_attachment(&digest, json!({})).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"\x00\x01binary"));
    }

    #[tokio::test]
    async fn test_destroy_is_forbidden() {
        let err = PeerDatabase::destroy("webrtc://hub/share-1").await.unwrap_err();
        assert_eq!(err.status, 403);
    }

    #[tokio::test]
    async fn test_unknown_share_name() {
        let directory = ShareDirectory::new();
        let err = PeerDatabase::open(&directory, "webrtc://nowhere/share-x", ConnectOptions::default())
            .await
            .err()
            .expect("open should fail");
        assert!(err.to_string().contains("Unknown PeerPouch share dbname"));
    }

    #[tokio::test]
    async fn test_changes_follow_and_cancel() {
        let (db, peer) = local_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = peer.changes(
            ChangesOptions {
                continuous: true,
                ..Default::default()
            },
            Arc::new(move |change: Value| {
                let _ = tx.send(change);
            }),
        );

        db.bulk_docs(vec![json!({"_id": "a"})], json!({})).await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change["id"], json!("a"));

        handle.cancel();
        assert_eq!(db.listener_count(), 0);
    }
}
