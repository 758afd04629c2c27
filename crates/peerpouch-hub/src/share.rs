//! Sharing databases through the hub, and connecting to shared ones.
//!
//! Sharing posts a share record and watches the hub for signals addressed to
//! it. Each new peer gets its own responder link; once that link connects,
//! the database's method table is bootstrapped to the peer over RPC.
//!
//! The requesting side discovers share records, opens an initiator link to
//! one, relays the link's signals through the hub, and waits for the
//! bootstrap to build a [`PeerDatabase`].

use crate::database::{wrapped_api, Database};
use crate::directory::ShareDirectory;
use crate::error::{HubError, HubResult};
use crate::peer_db::{PeerDatabase, PeerSession};
use crate::store::RelayStore;
use crate::watch::{ChangeMultiplexer, Watcher};
use dashmap::DashMap;
use peerpouch_types::config::{PeerPouchConfig, TransportConfig};
use peerpouch_types::error::PeerPouchError;
use peerpouch_types::record::{HubDocument, ShareRecord, SignalEnvelope, SHARE_TYPE, SIGNAL_TYPE};
use peerpouch_wire::transport::PeerConnectionFactory;
use peerpouch_wire::{
    LinkEvent, LinkOptions, LinkRole, PeerLink, RpcHandler, RpcValue, SignalPayload, Tube,
    WireError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of the database name a discovered share is opened by.
pub const DBNAME_PREFIX: &str = "webrtc://";

/// Decides whether a connecting peer may use the share.
pub type RemoteHook = Arc<dyn Fn(&RemotePeer) -> bool + Send + Sync>;

/// A peer about to be handed a shared database.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    /// The peer's endpoint identity.
    pub peer_id: String,
    /// `info` from the peer's first signal.
    pub info: Value,
}

/// Options for [`ShareManager::share`].
#[derive(Clone, Default)]
pub struct ShareOptions {
    /// Human-readable share name.
    pub name: Option<String>,
    /// Metadata published with the share and echoed in its signals.
    pub info: Value,
    /// Return `false` to refuse a peer; its link is closed before bootstrap.
    pub on_remote: Option<RemoteHook>,
}

/// Options for [`ShareDescriptor::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Metadata sent along with every signal to the share.
    pub info: Value,
}

/// Everything a link needs to reach the hub and the transport.
struct Plumbing {
    hub: Arc<dyn RelayStore>,
    factory: Arc<dyn PeerConnectionFactory>,
    transport: TransportConfig,
    watch: ChangeMultiplexer,
}

impl Plumbing {
    async fn post_signal(&self, signal: SignalEnvelope) {
        let id = signal.id.clone();
        if let Err(e) = self.hub.post(signal.to_document()).await {
            warn!(signal = %id, error = %e, "Couldn't post signal");
        }
    }

    /// Delete a signal once it has been handed to its link.
    async fn consume_signal(&self, signal: &SignalEnvelope) {
        let tombstone = HubDocument::tombstone(signal.id.clone(), signal.rev.clone());
        if let Err(e) = self.hub.post(tombstone).await {
            warn!(signal = %signal.id, error = %e, "Couldn't clean up signal");
        }
    }
}

struct ActiveShare {
    record: ShareRecord,
    watcher: Watcher,
}

struct ManagerInner {
    plumbing: Arc<Plumbing>,
    directory: ShareDirectory,
    default_name: Option<String>,
    /// By share record id.
    shares: DashMap<String, ActiveShare>,
    /// Database id to share record id.
    shared_dbs: DashMap<String, String>,
}

/// Shares local databases and discovers remote ones on one hub.
#[derive(Clone)]
pub struct ShareManager {
    inner: Arc<ManagerInner>,
}

impl ShareManager {
    pub fn new(
        hub: Arc<dyn RelayStore>,
        factory: Arc<dyn PeerConnectionFactory>,
        directory: ShareDirectory,
        config: &PeerPouchConfig,
    ) -> Self {
        let watch = ChangeMultiplexer::new(hub.clone());
        Self {
            inner: Arc::new(ManagerInner {
                plumbing: Arc::new(Plumbing {
                    hub,
                    factory,
                    transport: config.transport.clone(),
                    watch,
                }),
                directory,
                default_name: config.hub.default_share_name.clone(),
                shares: DashMap::new(),
                shared_dbs: DashMap::new(),
            }),
        }
    }

    pub fn directory(&self) -> &ShareDirectory {
        &self.inner.directory
    }

    /// The hub change subscription this manager's watchers share.
    pub fn multiplexer(&self) -> &ChangeMultiplexer {
        &self.inner.plumbing.watch
    }

    /// Publish `db` on the hub and start serving peers that signal for it.
    pub async fn share(&self, db: Arc<dyn Database>, options: ShareOptions) -> HubResult<ShareRecord> {
        let db_id = db.id();
        let share_id = format!("share-{}", Uuid::new_v4());
        match self.inner.shared_dbs.entry(db_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return Err(PeerPouchError::AlreadyShared(existing.get().clone()).into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(share_id.clone());
            }
        }

        let name = options.name.or_else(|| self.inner.default_name.clone());
        let mut record = ShareRecord::new(share_id.clone(), name, options.info);
        match self.inner.plumbing.hub.post(record.to_document()).await {
            Ok(res) => record.rev = Some(res.rev),
            Err(e) => {
                self.inner.shared_dbs.remove(&db_id);
                return Err(e);
            }
        }

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let recipient = share_id.clone();
        let watcher = self.inner.plumbing.watch.add_watcher(SIGNAL_TYPE, move |doc| {
            match SignalEnvelope::from_document(doc) {
                Ok(signal) if signal.recipient == recipient => {
                    let _ = signals_tx.send(signal);
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Ignoring malformed signal record"),
            }
        });

        let server = ShareServer {
            plumbing: self.inner.plumbing.clone(),
            share: record.clone(),
            db,
            on_remote: options.on_remote,
        };
        tokio::spawn(server.serve(signals_rx));

        self.inner.shares.insert(
            share_id.clone(),
            ActiveShare {
                record: record.clone(),
                watcher,
            },
        );
        if let Err(e) = self.inner.plumbing.watch.wait_listening().await {
            warn!(share = %share_id, error = %e, "Share can't receive signals, withdrawing it");
            self.inner.shared_dbs.remove(&db_id);
            if let Err(cleanup) = self.inner.withdraw(&share_id).await {
                warn!(share = %share_id, error = %cleanup, "Couldn't delete share record");
            }
            return Err(e);
        }
        info!(share = %share_id, db = %db_id, "Database shared");
        Ok(record)
    }

    /// Withdraw the share of `db`. Links already established stay up.
    pub async fn unshare(&self, db: &dyn Database) -> HubResult<()> {
        let Some((_, share_id)) = self.inner.shared_dbs.remove(&db.id()) else {
            return Err(PeerPouchError::NotShared.into());
        };
        self.inner.withdraw(&share_id).await?;
        info!(share = %share_id, "Database unshared");
        Ok(())
    }

    /// Whether `share_id` names one of our own shares.
    pub fn is_local(&self, share_id: &str) -> bool {
        self.inner.shares.contains_key(share_id)
    }

    /// Share records of other endpoints currently on the hub.
    ///
    /// Directory entries for shares no longer on this hub are dropped.
    pub async fn get_shares(&self) -> HubResult<Vec<ShareDescriptor>> {
        let hub_id = self.inner.plumbing.hub.id();
        let records: Vec<ShareRecord> = self
            .inner
            .plumbing
            .hub
            .all_docs()
            .await?
            .iter()
            .filter(|doc| doc.doc_type() == Some(SHARE_TYPE))
            .filter_map(|doc| match ShareRecord::from_document(doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed share record");
                    None
                }
            })
            .collect();

        // Includes our own shares: the directory may be shared with other managers.
        let live: Vec<String> = records
            .iter()
            .map(|record| directory_name(hub_id, &record.id))
            .collect();
        self.inner
            .directory
            .remove_stale(&directory_name(hub_id, ""), &live);

        Ok(records
            .into_iter()
            .filter(|record| !self.is_local(&record.id))
            .map(|record| self.inner.localize(record))
            .collect())
    }

    /// Report share records from other endpoints as they are published.
    pub fn watch_shares<F>(&self, callback: F) -> Watcher
    where
        F: Fn(ShareDescriptor) + Send + Sync + 'static,
    {
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        self.inner.plumbing.watch.add_watcher(SHARE_TYPE, move |doc| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let Ok(record) = ShareRecord::from_document(doc) else {
                return;
            };
            if manager.shares.contains_key(&record.id) {
                return;
            }
            callback(manager.localize(record));
        })
    }
}

impl ManagerInner {
    /// Register a remote share in the directory.
    fn localize(&self, record: ShareRecord) -> ShareDescriptor {
        let name = directory_name(self.plumbing.hub.id(), &record.id);
        let descriptor = ShareDescriptor {
            dbname: format!("{DBNAME_PREFIX}{name}"),
            name,
            record,
            plumbing: self.plumbing.clone(),
        };
        self.directory.register(descriptor.clone());
        descriptor
    }

    /// Stop serving `share_id` and delete its record from the hub.
    async fn withdraw(&self, share_id: &str) -> HubResult<()> {
        let Some((_, active)) = self.shares.remove(share_id) else {
            return Err(PeerPouchError::NotShared.into());
        };
        active.watcher.cancel();
        self.plumbing
            .hub
            .post(HubDocument::tombstone(share_id.to_string(), active.record.rev.clone()))
            .await?;
        Ok(())
    }
}

/// `<hub id>/<share id>`, each part form-encoded.
pub fn directory_name(hub_id: &str, share_id: &str) -> String {
    let encode = |part: &str| url::form_urlencoded::byte_serialize(part.as_bytes()).collect::<String>();
    format!("{}/{}", encode(hub_id), encode(share_id))
}

// ---------------------------------------------------------------------------
// Share side
// ---------------------------------------------------------------------------

struct ShareServer {
    plumbing: Arc<Plumbing>,
    share: ShareRecord,
    db: Arc<dyn Database>,
    on_remote: Option<RemoteHook>,
}

impl ShareServer {
    /// Handle signals for this share until it is withdrawn.
    async fn serve(self, mut signals: mpsc::UnboundedReceiver<SignalEnvelope>) {
        let server = Arc::new(self);
        let mut peers: HashMap<String, PeerLink> = HashMap::new();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<String>();

        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => server.handle_signal(&mut peers, &closed_tx, signal).await,
                    None => break,
                },
                Some(peer) = closed_rx.recv() => {
                    debug!(share = %server.share.id, peer = %peer, "Forgetting closed link");
                    peers.remove(&peer);
                }
            }
        }
        debug!(share = %server.share.id, links = peers.len(), "Stopped serving share");
    }

    async fn handle_signal(
        self: &Arc<Self>,
        peers: &mut HashMap<String, PeerLink>,
        closed_tx: &mpsc::UnboundedSender<String>,
        signal: SignalEnvelope,
    ) {
        let link = match peers.get(&signal.sender) {
            Some(link) => link.clone(),
            None => match self.accept(&signal, closed_tx.clone()).await {
                Ok(link) => {
                    peers.insert(signal.sender.clone(), link.clone());
                    link
                }
                Err(e) => {
                    warn!(share = %self.share.id, peer = %signal.sender, error = %e, "Couldn't create link");
                    return;
                }
            },
        };
        link.receive_signal(&signal.data).await;
        self.plumbing.consume_signal(&signal).await;
    }

    /// Open a responder link for a new peer.
    async fn accept(
        self: &Arc<Self>,
        signal: &SignalEnvelope,
        closed_tx: mpsc::UnboundedSender<String>,
    ) -> HubResult<PeerLink> {
        let conn = self.plumbing.factory.create(&self.plumbing.transport).await?;
        let (link, events) = PeerLink::open(
            conn,
            LinkOptions {
                role: LinkRole::Responder,
                local_id: self.share.id.clone(),
                peer_id: signal.sender.clone(),
                label: self.plumbing.transport.channel_label.clone(),
            },
        )
        .await?;
        info!(share = %self.share.id, peer = %signal.sender, "New peer");

        let remote = RemotePeer {
            peer_id: signal.sender.clone(),
            info: signal.info.clone(),
        };
        tokio::spawn(self.clone().run_link(link.clone(), events, remote, closed_tx));
        Ok(link)
    }

    async fn run_link(
        self: Arc<Self>,
        link: PeerLink,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        remote: RemotePeer,
        closed_tx: mpsc::UnboundedSender<String>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Signal(payload) => {
                    let signal = SignalEnvelope::new(
                        format!("s-signal-{}", Uuid::new_v4()),
                        self.share.id.clone(),
                        remote.peer_id.clone(),
                        payload.to_value(),
                        self.share.info.clone(),
                    );
                    self.plumbing.post_signal(signal).await;
                }
                LinkEvent::Connected(tube) => {
                    if let Some(hook) = &self.on_remote {
                        if !hook(&remote) {
                            info!(share = %self.share.id, peer = %remote.peer_id, "Peer refused");
                            link.close().await;
                            continue;
                        }
                    }
                    self.bootstrap(tube, &remote);
                }
                LinkEvent::Closed => {
                    let _ = closed_tx.send(remote.peer_id.clone());
                    break;
                }
            }
        }
    }

    fn bootstrap(&self, tube: Tube, remote: &RemotePeer) {
        let rpc = RpcHandler::new(tube);
        let api = RpcValue::object([("api", wrapped_api(self.db.clone()))]);
        match rpc.bootstrap(vec![api]) {
            Ok(()) => info!(share = %self.share.id, peer = %remote.peer_id, "Bootstrapped peer"),
            Err(e) => warn!(share = %self.share.id, peer = %remote.peer_id, error = %e, "Bootstrap failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Requester side
// ---------------------------------------------------------------------------

/// A discovered remote share.
#[derive(Clone)]
pub struct ShareDescriptor {
    /// Directory name, `<hub>/<share id>`.
    pub name: String,
    /// Name to open the database by.
    pub dbname: String,
    /// The announcement as read from the hub.
    pub record: ShareRecord,
    plumbing: Arc<Plumbing>,
}

impl fmt::Debug for ShareDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareDescriptor")
            .field("name", &self.name)
            .field("dbname", &self.dbname)
            .field("record", &self.record)
            .finish()
    }
}

impl ShareDescriptor {
    pub fn share_id(&self) -> &str {
        &self.record.id
    }

    pub fn info(&self) -> &Value {
        &self.record.info
    }

    /// Connect to the share and wait for its database.
    ///
    /// There is no timeout: a share that never answers leaves this pending.
    pub async fn connect(&self, options: ConnectOptions) -> HubResult<PeerDatabase> {
        let plumbing = self.plumbing.clone();
        let client_id = format!("peer-{}", Uuid::new_v4());
        let share_id = self.record.id.clone();

        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let (from, to) = (share_id.clone(), client_id.clone());
        let watcher = plumbing.watch.add_watcher(SIGNAL_TYPE, move |doc| {
            if let Ok(signal) = SignalEnvelope::from_document(doc) {
                if signal.is_between(&from, &to) {
                    let _ = signals_tx.send(signal);
                }
            }
        });

        let opened = async {
            plumbing.watch.wait_listening().await?;
            let conn = plumbing.factory.create(&plumbing.transport).await?;
            let link = PeerLink::open(
                conn,
                LinkOptions {
                    role: LinkRole::Initiator,
                    local_id: client_id.clone(),
                    peer_id: share_id.clone(),
                    label: plumbing.transport.channel_label.clone(),
                },
            )
            .await?;
            Ok::<_, HubError>(link)
        }
        .await;
        let (link, events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                watcher.cancel();
                return Err(e);
            }
        };
        info!(peer = %client_id, share = %share_id, "Connecting to share");

        let receiver = link.clone();
        let cleaner = plumbing.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals_rx.recv().await {
                receiver.receive_signal(&signal.data).await;
                cleaner.consume_signal(&signal).await;
            }
        });

        let (tube_tx, tube_rx) = oneshot::channel();
        tokio::spawn(relay_requester_events(
            plumbing.clone(),
            events,
            client_id.clone(),
            share_id.clone(),
            options.info,
            tube_tx,
        ));

        let established = async {
            let tube = tube_rx.await.map_err(|_| WireError::Closed)?;
            let (api_tx, api_rx) = oneshot::channel();
            let api_tx = Mutex::new(Some(api_tx));
            let rpc = RpcHandler::with_bootstrap(tube, move |args: Vec<RpcValue>| {
                let sender = api_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(sender) = sender {
                    let _ = sender.send(args);
                }
            });
            let args = api_rx.await.map_err(|_| WireError::Closed)?;
            Ok::<_, HubError>((rpc, args))
        }
        .await;

        match established {
            Ok((rpc, args)) => {
                let api = args
                    .into_iter()
                    .next()
                    .and_then(|arg| arg.get("api").cloned())
                    .unwrap_or_default();
                info!(peer = %client_id, share = %share_id, "Remote database ready");
                Ok(PeerDatabase::connected(
                    self.dbname.clone(),
                    &api,
                    PeerSession::new(link, rpc, watcher),
                ))
            }
            Err(e) => {
                warn!(peer = %client_id, share = %share_id, error = %e, "Connection failed");
                watcher.cancel();
                link.close().await;
                Err(e)
            }
        }
    }
}

async fn relay_requester_events(
    plumbing: Arc<Plumbing>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    client_id: String,
    share_id: String,
    info: Value,
    tube_tx: oneshot::Sender<Tube>,
) {
    let mut tube_tx = Some(tube_tx);
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Signal(payload) => {
                let signal = requester_signal(&client_id, &share_id, &payload, &info);
                plumbing.post_signal(signal).await;
            }
            LinkEvent::Connected(tube) => {
                if let Some(tx) = tube_tx.take() {
                    let _ = tx.send(tube);
                }
            }
            LinkEvent::Closed => break,
        }
    }
    debug!(peer = %client_id, "Link to share closed");
}

fn requester_signal(
    client_id: &str,
    share_id: &str,
    payload: &SignalPayload,
    info: &Value,
) -> SignalEnvelope {
    SignalEnvelope::new(
        format!("p-signal-{}", Uuid::new_v4()),
        client_id,
        share_id,
        payload.to_value(),
        info.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use crate::memory_db::MemoryDatabase;
    use crate::store::{ChangeFeed, HubInfo, PostResponse};
    use crate::watch::FeedStatus;
    use async_trait::async_trait;
    use peerpouch_wire::MockNetwork;

    /// A hub that stores records but can't open a change feed.
    struct FeedlessHub {
        hub: Arc<MemoryHub>,
    }

    #[async_trait]
    impl RelayStore for FeedlessHub {
        fn id(&self) -> &str {
            self.hub.id()
        }

        async fn post(&self, doc: HubDocument) -> HubResult<PostResponse> {
            self.hub.post(doc).await
        }

        async fn all_docs(&self) -> HubResult<Vec<HubDocument>> {
            self.hub.all_docs().await
        }

        async fn info(&self) -> HubResult<HubInfo> {
            self.hub.info().await
        }

        async fn changes(&self, _since: u64) -> HubResult<ChangeFeed> {
            Err(PeerPouchError::Hub("change feed unavailable".into()).into())
        }
    }

    #[tokio::test]
    async fn test_share_withdrawn_when_feed_cannot_open() {
        let memory = Arc::new(MemoryHub::new("hub"));
        let manager = ShareManager::new(
            Arc::new(FeedlessHub {
                hub: memory.clone(),
            }),
            Arc::new(MockNetwork::new()),
            ShareDirectory::new(),
            &PeerPouchConfig::default(),
        );
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new("notes"));

        let err = manager
            .share(db.clone(), ShareOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::PeerPouch(PeerPouchError::Hub(_))));
        assert_eq!(memory.count_of_type(SHARE_TYPE), 0);
        assert_eq!(manager.multiplexer().watcher_count(), 0);
        assert_eq!(manager.multiplexer().status(), FeedStatus::Idle);
        assert!(manager.inner.shares.is_empty());

        // The database is not left reserved.
        let retry = manager.share(db, ShareOptions::default()).await.unwrap_err();
        assert!(matches!(retry, HubError::PeerPouch(PeerPouchError::Hub(_))));
    }

    #[test]
    fn test_directory_name_encodes_parts() {
        assert_eq!(directory_name("hub", "share-1"), "hub/share-1");
        assert_eq!(directory_name("my hub/1", "share-1"), "my+hub%2F1/share-1");
    }

    #[test]
    fn test_requester_signal_addressing() {
        let payload = SignalPayload::Description(peerpouch_wire::transport::SessionDescription::offer("v=0"));
        let signal = requester_signal("peer-1", "share-1", &payload, &serde_json::json!({"who": "me"}));
        assert!(signal.id.starts_with("p-signal-"));
        assert!(signal.is_between("peer-1", "share-1"));
        assert_eq!(signal.data["type"], "offer");
        assert_eq!(signal.info["who"], "me");
    }
}
