//! The database surface a share exposes to its peers.
//!
//! A shared database is reached only through a fixed table of asynchronous
//! methods. Over the link each method takes its arguments positionally with a
//! callback last, and answers through that callback as `(error)` or
//! `(null, result)`; nothing is returned directly. [`wrapped_api`] builds that
//! table for a local [`Database`].

use async_trait::async_trait;
use bytes::Bytes;
use peerpouch_types::error::DbError;
use peerpouch_wire::{Function, RpcValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Result of a database operation.
pub type DbResult<T> = Result<T, DbError>;

/// Receives change-feed entries.
pub type ChangeListener = Arc<dyn Fn(Value) + Send + Sync>;

/// Wire names of the exposed methods.
pub mod method {
    pub const BULK_DOCS: &str = "bulkDocs";
    pub const GET_REVISION_TREE: &str = "_getRevisionTree";
    pub const DO_COMPACTION: &str = "_doCompaction";
    pub const GET: &str = "_get";
    pub const GET_ATTACHMENT: &str = "_getAttachment";
    pub const ALL_DOCS: &str = "_allDocs";
    pub const CHANGES: &str = "_changes";
    pub const CLOSE: &str = "_close";
    pub const INFO: &str = "_info";
    /// Not a method: the database's identity as a plain string.
    pub const ID: &str = "_id";
}

/// Options for a change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangesOptions {
    /// Only report changes after this sequence.
    pub since: u64,
    /// Include full documents in each entry.
    pub include_docs: bool,
    /// Keep reporting new changes until cancelled.
    pub continuous: bool,
}

impl ChangesOptions {
    /// Read options sent by a peer, ignoring whatever does not fit.
    pub fn from_json(value: &Value) -> Self {
        Self {
            since: value.get("since").and_then(Value::as_u64).unwrap_or(0),
            include_docs: value
                .get("include_docs")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            continuous: value
                .get("continuous")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Cancels a change feed. Only the first cancel has an effect.
pub struct ChangesHandle {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ChangesHandle {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A handle for a feed that needs no cancelling.
    pub fn noop() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn cancel(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl std::fmt::Debug for ChangesHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesHandle").finish_non_exhaustive()
    }
}

/// A database that can be shared.
///
/// Documents, options and results are JSON in the usual document-store shapes
/// (`{_id, _rev, ...}` documents, `{ok, id, rev}` write results). Everything
/// here may be driven by an untrusted peer.
#[async_trait]
pub trait Database: Send + Sync {
    /// Identity of the database.
    fn id(&self) -> String;

    /// Write a batch of documents. Returns one result per document.
    async fn bulk_docs(&self, docs: Vec<Value>, opts: Value) -> DbResult<Value>;

    async fn get_revision_tree(&self, _doc_id: &str) -> DbResult<Value> {
        Err(DbError::not_implemented())
    }

    async fn do_compaction(
        &self,
        _doc_id: &str,
        _rev_tree: Value,
        _revs: Vec<String>,
    ) -> DbResult<()> {
        Err(DbError::not_implemented())
    }

    async fn get(&self, id: &str, opts: Value) -> DbResult<Value>;

    /// Attachment body by digest.
    async fn get_attachment(&self, digest: &str, opts: Value) -> DbResult<Bytes>;

    async fn all_docs(&self, opts: Value) -> DbResult<Value>;

    /// Start a change feed. Entries reach `listener` until the handle is
    /// cancelled (or, for a non-continuous feed, once the backlog is sent).
    fn changes(&self, opts: ChangesOptions, listener: ChangeListener) -> ChangesHandle;

    async fn close(&self) -> DbResult<()>;

    async fn info(&self) -> DbResult<Value>;
}

/// The error value a callback receives.
pub fn error_value(err: &DbError) -> RpcValue {
    RpcValue::from(serde_json::to_value(err).unwrap_or(Value::Null))
}

/// Turn callback arguments `(error)` / `(null, result)` into a result.
pub fn callback_result(mut args: Vec<RpcValue>) -> DbResult<RpcValue> {
    if args.first().map_or(false, |err| !err.is_null()) {
        return Err(DbError::from_remote(&args[0].to_json()));
    }
    Ok(if args.len() > 1 {
        args.swap_remove(1)
    } else {
        RpcValue::Null
    })
}

fn reply(callback: Option<Function>, result: DbResult<RpcValue>) {
    let Some(callback) = callback else {
        debug!("Result dropped, caller passed no callback");
        return;
    };
    let args = match result {
        Ok(value) => vec![RpcValue::Null, value],
        Err(e) => vec![error_value(&e)],
    };
    if let Err(e) = callback.call(args) {
        warn!(error = %e, "Couldn't deliver result to peer");
    }
}

/// Split the trailing callback off the arguments.
fn take_callback(args: &mut Vec<RpcValue>) -> Option<Function> {
    match args.last() {
        Some(RpcValue::Function(_)) => match args.pop() {
            Some(RpcValue::Function(f)) => Some(f),
            _ => None,
        },
        _ => None,
    }
}

fn arg_json(args: &[RpcValue], index: usize) -> Value {
    args.get(index).map(RpcValue::to_json).unwrap_or(Value::Null)
}

fn arg_string(args: &[RpcValue], index: usize, what: &str) -> DbResult<String> {
    args.get(index)
        .and_then(RpcValue::as_str)
        .map(String::from)
        .ok_or_else(|| DbError::bad_request(format!("{what} must be a string")))
}

/// A kept method that runs `op` on a task and answers through the callback.
fn exposed_method<F, Fut>(db: &Arc<dyn Database>, op: F) -> RpcValue
where
    F: Fn(Arc<dyn Database>, Vec<RpcValue>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DbResult<RpcValue>> + Send + 'static,
{
    let db = db.clone();
    RpcValue::Function(Function::kept(move |mut args| {
        let callback = take_callback(&mut args);
        let pending = op(db.clone(), args);
        tokio::spawn(async move { reply(callback, pending.await) });
        Ok(())
    }))
}

fn json_result(result: DbResult<Value>) -> DbResult<RpcValue> {
    result.map(RpcValue::from)
}

/// The method table handed to a peer for `db`.
pub fn wrapped_api(db: Arc<dyn Database>) -> RpcValue {
    let mut api = std::collections::BTreeMap::new();

    api.insert(
        method::BULK_DOCS.to_string(),
        exposed_method(&db, |db, args| async move {
            let req = arg_json(&args, 0);
            let docs = match req {
                Value::Array(docs) => docs,
                Value::Object(mut req) => match req.remove("docs") {
                    Some(Value::Array(docs)) => docs,
                    _ => return Err(DbError::bad_request("missing docs")),
                },
                _ => return Err(DbError::bad_request("missing docs")),
            };
            json_result(db.bulk_docs(docs, arg_json(&args, 1)).await)
        }),
    );
    api.insert(
        method::GET_REVISION_TREE.to_string(),
        exposed_method(&db, |db, args| async move {
            let id = arg_string(&args, 0, "document id")?;
            json_result(db.get_revision_tree(&id).await)
        }),
    );
    api.insert(
        method::DO_COMPACTION.to_string(),
        exposed_method(&db, |db, args| async move {
            let id = arg_string(&args, 0, "document id")?;
            let revs = match arg_json(&args, 2) {
                Value::Array(revs) => revs
                    .into_iter()
                    .filter_map(|rev| rev.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            };
            db.do_compaction(&id, arg_json(&args, 1), revs).await?;
            Ok::<_, DbError>(RpcValue::Null)
        }),
    );
    api.insert(
        method::GET.to_string(),
        exposed_method(&db, |db, args| async move {
            let id = arg_string(&args, 0, "document id")?;
            json_result(db.get(&id, arg_json(&args, 1)).await)
        }),
    );
    api.insert(
        method::GET_ATTACHMENT.to_string(),
        exposed_method(&db, |db, args| async move {
            let digest = match arg_json(&args, 0) {
                Value::String(digest) => digest,
                Value::Object(stub) => stub
                    .get("digest")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| DbError::bad_request("attachment has no digest"))?,
                _ => return Err(DbError::bad_request("attachment has no digest")),
            };
            let data = db.get_attachment(&digest, arg_json(&args, 1)).await?;
            Ok::<_, DbError>(RpcValue::from(data))
        }),
    );
    api.insert(
        method::ALL_DOCS.to_string(),
        exposed_method(&db, |db, args| async move {
            json_result(db.all_docs(arg_json(&args, 0)).await)
        }),
    );
    api.insert(
        method::CLOSE.to_string(),
        exposed_method(&db, |db, _args| async move {
            db.close().await?;
            Ok::<_, DbError>(RpcValue::Null)
        }),
    );
    api.insert(
        method::INFO.to_string(),
        exposed_method(&db, |db, _args| async move { json_result(db.info().await) }),
    );
    api.insert(method::CHANGES.to_string(), changes_method(&db));
    api.insert(method::ID.to_string(), RpcValue::String(db.id()));

    RpcValue::Object(api)
}

/// `_changes(opts, cb)`: start the local feed, forwarding entries to
/// `opts.onChange`, then hand `cb` a one-shot function that cancels it.
fn changes_method(db: &Arc<dyn Database>) -> RpcValue {
    let db = db.clone();
    RpcValue::Function(Function::kept(move |args| {
        let mut args = args.into_iter();
        let opts = args.next().unwrap_or_default();
        let callback = match args.next() {
            Some(RpcValue::Function(f)) => Some(f),
            _ => None,
        };

        let on_change = opts.get("onChange").and_then(RpcValue::as_function).cloned();
        let listener: ChangeListener = Arc::new(move |change: Value| {
            if let Some(on_change) = &on_change {
                if let Err(e) = on_change.call(vec![RpcValue::from(change)]) {
                    debug!(error = %e, "Couldn't forward change to peer");
                }
            }
        });
        let handle = Arc::new(db.changes(ChangesOptions::from_json(&opts.to_json()), listener));

        if let Some(callback) = callback {
            let cancel = Function::new(move |_| {
                handle.cancel();
                Ok(())
            });
            callback.call(vec![RpcValue::Function(cancel)])?;
        }
        Ok(())
    }))
}
