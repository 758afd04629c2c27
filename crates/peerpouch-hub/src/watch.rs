//! Change-feed multiplexer.
//!
//! Keeps at most one live change subscription on a relay store and fans each
//! change out to the watchers registered for the record's `type`. The
//! subscription is opened when the first watcher arrives, at the store's
//! current position, and cancelled when the last one leaves. Changes made
//! while it is closed, or while it is being opened, are never seen.

use crate::error::{HubError, HubResult};
use crate::store::{ChangeFeed, RelayStore};
use peerpouch_types::error::PeerPouchError;
use peerpouch_types::record::HubDocument;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Called with every changed record of the watched type.
pub type WatchCallback = Arc<dyn Fn(&HubDocument) + Send + Sync>;

/// Where the shared subscription stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// No watchers, no subscription.
    Idle,
    /// Reading the current position before subscribing.
    Starting,
    /// Subscribed and delivering.
    Listening,
    /// Opening the subscription failed.
    Failed(String),
}

enum Listener {
    Idle,
    /// The flag is raised when the start is abandoned.
    Starting(Arc<AtomicBool>),
    Active(JoinHandle<()>),
}

struct MuxState {
    count: usize,
    by_type: HashMap<String, Vec<(u64, WatchCallback)>>,
    listener: Listener,
}

struct MuxInner {
    store: Arc<dyn RelayStore>,
    state: Mutex<MuxState>,
    status: watch::Sender<FeedStatus>,
    next_id: AtomicU64,
}

/// Shared change subscription for one relay store.
#[derive(Clone)]
pub struct ChangeMultiplexer {
    inner: Arc<MuxInner>,
}

/// A registration returned by [`ChangeMultiplexer::add_watcher`].
///
/// Dropping it cancels the registration.
pub struct Watcher {
    id: u64,
    doc_type: String,
    cancelled: AtomicBool,
    inner: Arc<MuxInner>,
}

impl ChangeMultiplexer {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        let (status, _) = watch::channel(FeedStatus::Idle);
        Self {
            inner: Arc::new(MuxInner {
                store,
                state: Mutex::new(MuxState {
                    count: 0,
                    by_type: HashMap::new(),
                    listener: Listener::Idle,
                }),
                status,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Route changed records whose `type` is `doc_type` to `callback`.
    ///
    /// Callbacks run on the feed task, one change at a time, and must not
    /// block.
    pub fn add_watcher<F>(&self, doc_type: &str, callback: F) -> Watcher
    where
        F: Fn(&HubDocument) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.lock();
        state
            .by_type
            .entry(doc_type.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        state.count += 1;
        debug!(doc_type, watchers = state.count, "Added watcher");

        if matches!(state.listener, Listener::Idle) {
            let abandoned = Arc::new(AtomicBool::new(false));
            state.listener = Listener::Starting(abandoned.clone());
            self.inner.status.send_replace(FeedStatus::Starting);
            let inner = self.inner.clone();
            tokio::spawn(async move { MuxInner::start(inner, abandoned).await });
        }

        Watcher {
            id,
            doc_type: doc_type.to_string(),
            cancelled: AtomicBool::new(false),
            inner: self.inner.clone(),
        }
    }

    /// Live registrations across all types.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn status(&self) -> FeedStatus {
        self.inner.status.borrow().clone()
    }

    /// Whether the shared subscription is open.
    pub fn is_listening(&self) -> bool {
        self.status() == FeedStatus::Listening
    }

    /// Wait until the shared subscription is open.
    ///
    /// Fails if opening it failed, or if there is nothing to open it for.
    pub async fn wait_listening(&self) -> HubResult<()> {
        let mut rx = self.inner.status.subscribe();
        loop {
            let status = rx.borrow_and_update().clone();
            match status {
                FeedStatus::Listening => return Ok(()),
                FeedStatus::Starting => {}
                FeedStatus::Idle => {
                    return Err(PeerPouchError::Hub("no watchers registered".into()).into())
                }
                FeedStatus::Failed(reason) => return Err(PeerPouchError::Hub(reason).into()),
            }
            rx.changed()
                .await
                .map_err(|_| HubError::from(PeerPouchError::Hub("multiplexer dropped".into())))?;
        }
    }
}

impl MuxInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn start(inner: Arc<MuxInner>, abandoned: Arc<AtomicBool>) {
        let opened = async {
            let since = inner.store.info().await?.update_seq;
            let feed = inner.store.changes(since).await?;
            Ok::<_, HubError>((since, feed))
        }
        .await;

        let mut state = inner.lock();
        let current = matches!(
            &state.listener,
            Listener::Starting(flag) if Arc::ptr_eq(flag, &abandoned)
        );
        if !current || abandoned.load(Ordering::Acquire) {
            debug!("Change subscription no longer wanted");
            return;
        }

        match opened {
            Ok((since, feed)) => {
                debug!(since, "Listening for hub changes");
                let handle = tokio::spawn(pump(Arc::downgrade(&inner), feed));
                state.listener = Listener::Active(handle);
                inner.status.send_replace(FeedStatus::Listening);
            }
            Err(e) => {
                warn!(error = %e, "Couldn't open hub change feed");
                state.listener = Listener::Idle;
                inner.status.send_replace(FeedStatus::Failed(e.to_string()));
            }
        }
    }

    fn remove(&self, id: u64, doc_type: &str) {
        let mut state = self.lock();
        let Some(entries) = state.by_type.get_mut(doc_type) else {
            return;
        };
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        if entries.len() == before {
            return;
        }
        if entries.is_empty() {
            state.by_type.remove(doc_type);
        }
        state.count -= 1;
        debug!(doc_type, watchers = state.count, "Removed watcher");

        if state.count == 0 {
            match std::mem::replace(&mut state.listener, Listener::Idle) {
                Listener::Starting(abandoned) => abandoned.store(true, Ordering::Release),
                Listener::Active(handle) => handle.abort(),
                Listener::Idle => {}
            }
            self.status.send_replace(FeedStatus::Idle);
            debug!("Stopped listening for hub changes");
        }
    }
}

async fn pump(inner: Weak<MuxInner>, mut feed: ChangeFeed) {
    while let Some(change) = feed.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let Some(doc_type) = change.doc.doc_type() else {
            continue;
        };
        let callbacks: Vec<WatchCallback> = inner
            .lock()
            .by_type
            .get(doc_type)
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&change.doc);
        }
    }
}

impl Watcher {
    /// Remove this registration. Calling it again does nothing.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.remove(self.id, &self.doc_type);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("doc_type", &self.doc_type)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
