//! In-memory document database, for demos and tests.

use crate::database::{ChangeListener, ChangesHandle, ChangesOptions, Database, DbResult};
use async_trait::async_trait;
use bytes::Bytes;
use peerpouch_types::error::DbError;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// A database held entirely in memory.
pub struct MemoryDatabase {
    id: String,
    state: Arc<Mutex<DbState>>,
}

#[derive(Default)]
struct DbState {
    docs: BTreeMap<String, Map<String, Value>>,
    /// Latest change seq for each document.
    by_seq: BTreeMap<u64, String>,
    seq: u64,
    attachments: HashMap<String, Bytes>,
    listeners: HashMap<u64, (bool, ChangeListener)>,
    next_listener: u64,
}

impl DbState {
    fn change_entry(&self, seq: u64, id: &str, include_docs: bool) -> Option<Value> {
        let doc = self.docs.get(id)?;
        let mut entry = json!({
            "seq": seq,
            "id": id,
            "changes": [{"rev": doc.get("_rev").cloned().unwrap_or(Value::Null)}],
        });
        if doc.get("_deleted") == Some(&Value::Bool(true)) {
            entry["deleted"] = Value::Bool(true);
        }
        if include_docs {
            entry["doc"] = Value::Object(doc.clone());
        }
        Some(entry)
    }
}

fn is_deleted(doc: &Map<String, Value>) -> bool {
    doc.get("_deleted") == Some(&Value::Bool(true))
}

fn generation(rev: Option<&Value>) -> u64 {
    rev.and_then(Value::as_str)
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

impl MemoryDatabase {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(DbState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an attachment body and return its digest.
    pub fn put_attachment(&self, data: impl Into<Bytes>) -> String {
        let data = data.into();
        let digest = format!("sha256-{}", hex::encode(Sha256::digest(&data)));
        self.lock().attachments.insert(digest.clone(), data);
        digest
    }

    /// Change feeds currently following this database.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Apply one write. Returns the per-document result and, on success, the
    /// seq and id of the change.
    fn write_one(state: &mut DbState, doc: Value) -> (Value, Option<(u64, String)>) {
        let Value::Object(mut doc) = doc else {
            return (
                json!({"error": "bad_request", "reason": "document must be an object", "status": 400}),
                None,
            );
        };
        let id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let current = state.docs.get(&id);
        let current_rev = current.and_then(|d| d.get("_rev")).cloned();
        let live = current.map_or(false, |d| !is_deleted(d));
        let given_rev = doc.get("_rev").cloned();
        let conflict = match (&given_rev, live) {
            (None, true) => true,
            (Some(_), _) => given_rev != current_rev,
            (None, false) => false,
        };
        if conflict {
            let err = DbError::conflict();
            return (
                json!({"id": id, "error": err.error, "reason": err.reason, "status": err.status}),
                None,
            );
        }

        let rev = format!(
            "{}-{}",
            generation(current_rev.as_ref()) + 1,
            Uuid::new_v4().simple()
        );
        doc.insert("_id".into(), Value::String(id.clone()));
        doc.insert("_rev".into(), Value::String(rev.clone()));
        if is_deleted(&doc) {
            doc.retain(|k, _| k == "_id" || k == "_rev" || k == "_deleted");
        }

        state.seq += 1;
        let seq = state.seq;
        state.by_seq.retain(|_, existing| *existing != id);
        state.by_seq.insert(seq, id.clone());
        state.docs.insert(id.clone(), doc);
        (json!({"ok": true, "id": id, "rev": rev}), Some((seq, id)))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn bulk_docs(&self, docs: Vec<Value>, _opts: Value) -> DbResult<Value> {
        let mut results = Vec::with_capacity(docs.len());
        let mut notify = Vec::new();
        {
            let mut state = self.lock();
            for doc in docs {
                let (result, change) = Self::write_one(&mut state, doc);
                results.push(result);
                if let Some((seq, id)) = change {
                    for (include_docs, listener) in state.listeners.values() {
                        if let Some(entry) = state.change_entry(seq, &id, *include_docs) {
                            notify.push((listener.clone(), entry));
                        }
                    }
                }
            }
        }
        for (listener, entry) in notify {
            listener(entry);
        }
        Ok(Value::Array(results))
    }

    async fn get(&self, id: &str, _opts: Value) -> DbResult<Value> {
        let state = self.lock();
        match state.docs.get(id) {
            Some(doc) if is_deleted(doc) => Err(DbError::not_found("deleted")),
            Some(doc) => Ok(Value::Object(doc.clone())),
            None => Err(DbError::not_found("missing")),
        }
    }

    async fn get_attachment(&self, digest: &str, _opts: Value) -> DbResult<Bytes> {
        self.lock()
            .attachments
            .get(digest)
            .cloned()
            .ok_or_else(|| DbError::not_found(format!("no attachment {digest}")))
    }

    async fn all_docs(&self, opts: Value) -> DbResult<Value> {
        let include_docs = opts
            .get("include_docs")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let state = self.lock();
        let rows: Vec<Value> = state
            .docs
            .iter()
            .filter(|(_, doc)| !is_deleted(doc))
            .map(|(id, doc)| {
                let mut row = json!({
                    "id": id,
                    "key": id,
                    "value": {"rev": doc.get("_rev").cloned().unwrap_or(Value::Null)},
                });
                if include_docs {
                    row["doc"] = Value::Object(doc.clone());
                }
                row
            })
            .collect();
        Ok(json!({"total_rows": rows.len(), "offset": 0, "rows": rows}))
    }

    fn changes(&self, opts: ChangesOptions, listener: ChangeListener) -> ChangesHandle {
        let (backlog, token) = {
            let mut state = self.lock();
            let backlog: Vec<Value> = state
                .by_seq
                .range(opts.since + 1..)
                .filter_map(|(seq, id)| state.change_entry(*seq, id, opts.include_docs))
                .collect();
            let token = opts.continuous.then(|| {
                state.next_listener += 1;
                let token = state.next_listener;
                state
                    .listeners
                    .insert(token, (opts.include_docs, listener.clone()));
                token
            });
            (backlog, token)
        };
        debug!(db = %self.id, since = opts.since, backlog = backlog.len(), "Change feed started");
        for entry in backlog {
            listener(entry);
        }

        match token {
            Some(token) => {
                let state = self.state.clone();
                ChangesHandle::new(move || {
                    state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .listeners
                        .remove(&token);
                })
            }
            None => ChangesHandle::noop(),
        }
    }

    async fn close(&self) -> DbResult<()> {
        debug!(db = %self.id, "Closing database");
        Ok(())
    }

    async fn info(&self) -> DbResult<Value> {
        let state = self.lock();
        Ok(json!({
            "db_name": self.id,
            "doc_count": state.docs.values().filter(|doc| !is_deleted(doc)).count(),
            "update_seq": state.seq,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<Value>>>, ChangeListener) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Arc::new(move |change: Value| sink.lock().unwrap().push(change)))
    }

    #[tokio::test]
    async fn test_write_update_conflict() {
        let db = MemoryDatabase::new("db");
        let res = db
            .bulk_docs(vec![json!({"_id": "a", "v": 1})], json!({}))
            .await
            .unwrap();
        let rev = res[0]["rev"].as_str().unwrap().to_string();
        assert!(rev.starts_with("1-"));

        let res = db
            .bulk_docs(
                vec![json!({"_id": "a", "v": 2}), json!({"_id": "a", "_rev": rev, "v": 2})],
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(res[0]["status"], json!(409));
        assert_eq!(res[1]["ok"], json!(true));
        assert_eq!(db.get("a", json!({})).await.unwrap()["v"], json!(2));
    }

    #[tokio::test]
    async fn test_delete_hides_document() {
        let db = MemoryDatabase::new("db");
        let res = db.bulk_docs(vec![json!({"_id": "a"})], json!({})).await.unwrap();
        let rev = res[0]["rev"].clone();
        db.bulk_docs(
            vec![json!({"_id": "a", "_rev": rev, "_deleted": true})],
            json!({}),
        )
        .await
        .unwrap();

        assert_eq!(db.get("a", json!({})).await.unwrap_err().status, 404);
        let all = db.all_docs(json!({})).await.unwrap();
        assert_eq!(all["total_rows"], json!(0));
        assert_eq!(db.info().await.unwrap()["update_seq"], json!(2));
    }

    #[tokio::test]
    async fn test_all_docs_with_docs() {
        let db = MemoryDatabase::new("db");
        db.bulk_docs(vec![json!({"_id": "b"}), json!({"_id": "a", "x": 1})], json!({}))
            .await
            .unwrap();
        let all = db.all_docs(json!({"include_docs": true})).await.unwrap();
        assert_eq!(all["rows"][0]["id"], json!("a"));
        assert_eq!(all["rows"][0]["doc"]["x"], json!(1));
    }

    #[tokio::test]
    async fn test_attachments_by_digest() {
        let db = MemoryDatabase::new("db");
        let digest = db.put_attachment(Bytes::from_static(b"hello"));
        assert!(digest.starts_with("sha256-2cf24dba"));
        assert_eq!(
            db.get_attachment(&digest, json!({})).await.unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(
            db.get_attachment("sha256-none", json!({})).await.unwrap_err().status,
            404
        );
    }

    #[tokio::test]
    async fn test_changes_backlog_then_live_until_cancel() {
        let db = MemoryDatabase::new("db");
        db.bulk_docs(vec![json!({"_id": "a"}), json!({"_id": "b"})], json!({}))
            .await
            .unwrap();

        let (seen, listener) = recorder();
        let handle = db.changes(
            ChangesOptions {
                since: 1,
                include_docs: true,
                continuous: true,
            },
            listener,
        );
        db.bulk_docs(vec![json!({"_id": "c"})], json!({})).await.unwrap();
        handle.cancel();
        handle.cancel();
        db.bulk_docs(vec![json!({"_id": "d"})], json!({})).await.unwrap();

        let ids: Vec<Value> = seen.lock().unwrap().iter().map(|c| c["id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("c")]);
        assert_eq!(seen.lock().unwrap()[0]["doc"]["_id"], json!("b"));
        assert_eq!(db.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_one_shot_changes_do_not_follow() {
        let db = MemoryDatabase::new("db");
        db.bulk_docs(vec![json!({"_id": "a"})], json!({})).await.unwrap();
        let (seen, listener) = recorder();
        let _handle = db.changes(ChangesOptions::default(), listener);
        db.bulk_docs(vec![json!({"_id": "b"})], json!({})).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(db.listener_count(), 0);
    }
}
