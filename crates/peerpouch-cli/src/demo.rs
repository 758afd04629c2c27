//! `peerpouch demo`: two endpoints on one in-memory hub.
//!
//! The owner shares a seeded database; the visitor discovers it, connects
//! over the simulated transport, reads it, follows one live change, then
//! everything is torn down.

use crate::ui;
use peerpouch_hub::{
    ChangesOptions, ConnectOptions, Database, HubResult, MemoryDatabase, MemoryHub, PeerDatabase,
    RemotePeer, ShareDirectory, ShareManager, ShareOptions,
};
use peerpouch_types::config::PeerPouchConfig;
use peerpouch_types::error::PeerPouchError;
use peerpouch_wire::MockNetwork;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

const CHANGE_WAIT: Duration = Duration::from_secs(5);

pub async fn run(config: PeerPouchConfig, docs: usize) -> HubResult<()> {
    let hub_id = config
        .hub
        .id
        .clone()
        .unwrap_or_else(|| format!("hub-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    let hub = Arc::new(MemoryHub::new(hub_id.clone()));
    let network = MockNetwork::new();
    let owner = ShareManager::new(
        hub.clone(),
        Arc::new(network.clone()),
        ShareDirectory::new(),
        &config,
    );
    let visitor = ShareManager::new(
        hub.clone(),
        Arc::new(network.clone()),
        ShareDirectory::new(),
        &config,
    );

    ui::section("Owner");
    let db = Arc::new(MemoryDatabase::new("demo"));
    let seed: Vec<Value> = (1..=docs)
        .map(|n| json!({"_id": format!("doc-{n:03}"), "n": n}))
        .collect();
    db.bulk_docs(seed, json!({})).await?;
    let record = owner
        .share(
            db.clone(),
            ShareOptions {
                name: Some("demo".into()),
                info: json!({"role": "owner"}),
                on_remote: Some(Arc::new(|peer: &RemotePeer| {
                    info!(peer = %peer.peer_id, info = %peer.info, "Peer asks for the demo database");
                    true
                })),
            },
        )
        .await?;
    ui::kv("Hub", &hub_id);
    ui::kv("Share", &record.id);
    ui::kv("Documents", &docs.to_string());

    ui::blank();
    ui::section("Visitor");
    let shares = visitor.get_shares().await?;
    let Some(descriptor) = shares.into_iter().find(|s| s.share_id() == record.id) else {
        return Err(PeerPouchError::UnknownShare(record.id).into());
    };
    ui::kv("Found", &descriptor.dbname);

    let remote = PeerDatabase::open(
        visitor.directory(),
        &descriptor.dbname,
        ConnectOptions {
            info: json!({"role": "visitor"}),
        },
    )
    .await?;
    ui::success(&format!("Connected to remote database '{}'", remote.id()));

    let remote_info = remote.info().await?;
    ui::kv("Doc count", &remote_info["doc_count"].to_string());
    ui::kv("Update seq", &remote_info["update_seq"].to_string());

    let all = remote.all_docs(json!({"include_docs": true})).await?;
    let ids: Vec<&str> = all["rows"]
        .as_array()
        .map(|rows| rows.iter().filter_map(|row| row["id"].as_str()).collect())
        .unwrap_or_default();
    ui::kv("Rows", &ids.join(", "));

    ui::blank();
    ui::section("Live changes");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let feed = remote.changes(
        ChangesOptions {
            since: remote_info["update_seq"].as_u64().unwrap_or(0),
            include_docs: true,
            continuous: true,
        },
        Arc::new(move |change: Value| {
            let _ = tx.send(change);
        }),
    );
    db.bulk_docs(vec![json!({"_id": "late-arrival", "n": 0})], json!({}))
        .await?;
    match tokio::time::timeout(CHANGE_WAIT, rx.recv()).await {
        Ok(Some(change)) => ui::success(&format!("Change seen remotely: {}", change["id"])),
        _ => ui::error("No change arrived"),
    }
    feed.cancel();

    ui::blank();
    remote.close().await?;
    owner.unshare(db.as_ref()).await?;
    ui::success("Closed the remote database and withdrew the share");
    ui::hint("run with RUST_LOG=debug to see the signalling");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_runs_to_completion() {
        let mut config = PeerPouchConfig::default();
        config.hub.id = Some("demo-test".into());
        tokio::time::timeout(Duration::from_secs(10), run(config, 2))
            .await
            .expect("demo timed out")
            .unwrap();
    }
}
