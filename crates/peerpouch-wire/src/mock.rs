//! In-memory peer transport for tests and demos.
//!
//! A [`MockNetwork`] hands out connections that negotiate through real
//! offer/answer exchanges: the offer names a session registered on the
//! network, and the side that applies the matching answer gets a data channel
//! wired to the offerer's. Nothing leaves the process.

use crate::transport::{
    ChannelEvent, ConnectionEvent, DataChannel, Frame, IceCandidate, PeerConnection,
    PeerConnectionFactory, SdpType, SessionDescription, TransportError,
};
use async_trait::async_trait;
use peerpouch_types::config::TransportConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

const SESSION_PREFIX: &str = "mock-session:";

// ============================================================================
// Mock Data Channel
// ============================================================================

/// One end of an in-memory channel.
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    inbox_tx: mpsc::UnboundedSender<ChannelEvent>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    remote: RwLock<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl MockDataChannel {
    /// An unconnected, closed channel.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            remote: RwLock::new(None),
        })
    }

    /// Two channels wired to each other. Neither is open yet.
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label);
        let b = Self::new(label);
        Self::connect(&a, &b);
        (a, b)
    }

    /// Wire two channels to each other.
    pub fn connect(a: &MockDataChannel, b: &MockDataChannel) {
        *a.remote.write().unwrap_or_else(|e| e.into_inner()) = Some(b.inbox_tx.clone());
        *b.remote.write().unwrap_or_else(|e| e.into_inner()) = Some(a.inbox_tx.clone());
    }

    /// Open this end and raise [`ChannelEvent::Open`].
    pub fn mark_open(&self) {
        if self.closed.load(Ordering::Acquire) || self.open.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inbox_tx.send(ChannelEvent::Open);
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let remote = self
            .remote
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::NotConnected)?;
        remote
            .send(ChannelEvent::Message(frame))
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Option<ChannelEvent> {
        let event = self.inbox_rx.lock().await.recv().await;
        if matches!(event, Some(ChannelEvent::Closed)) {
            self.open.store(false, Ordering::Release);
            self.closed.store(true, Ordering::Release);
        }
        event
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        let _ = self.inbox_tx.send(ChannelEvent::Closed);
        let remote = self.remote.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(remote) = remote {
            let _ = remote.send(ChannelEvent::Closed);
        }
    }
}

// ============================================================================
// Mock Network
// ============================================================================

/// Factory for connected in-memory peer connections.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    /// Offerer channels waiting for an answer, by session id.
    sessions: Mutex<HashMap<String, Arc<MockDataChannel>>>,
    connections: AtomicUsize,
    configs: Mutex<Vec<TransportConfig>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers that have not been answered yet.
    pub fn pending_sessions(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Connections created so far.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::Relaxed)
    }

    /// The transport settings each connection was created with, in order.
    pub fn created_configs(&self) -> Vec<TransportConfig> {
        self.inner
            .configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockNetwork {
    async fn create(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
        self.inner
            .configs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config.clone());
        Ok(Arc::new(MockPeerConnection::new(self.inner.clone(), config)))
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

#[derive(Default)]
struct ConnState {
    channel: Option<Arc<MockDataChannel>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    session: Option<String>,
    closed: bool,
}

/// A peer connection on a [`MockNetwork`].
pub struct MockPeerConnection {
    id: Uuid,
    /// `srflx` when ICE servers are configured, `host` otherwise.
    candidate_type: &'static str,
    network: Arc<NetworkInner>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
    state: Mutex<ConnState>,
}

impl MockPeerConnection {
    fn new(network: Arc<NetworkInner>, config: &TransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            candidate_type: if config.ice_servers.is_empty() {
                "host"
            } else {
                "srflx"
            },
            network,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            state: Mutex::new(ConnState::default()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn session_of(desc: &SessionDescription) -> Result<String, TransportError> {
        desc.sdp
            .strip_prefix(SESSION_PREFIX)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Negotiation(format!("foreign sdp: {}", desc.sdp)))
    }

    /// Answer side: build our channel and wire it to the offerer's.
    fn pair_with_offerer(&self, session: &str) -> Result<(), TransportError> {
        let offerer = self
            .network
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session)
            .ok_or_else(|| TransportError::Negotiation(format!("unknown session {session}")))?;
        let channel = MockDataChannel::new(offerer.label());
        MockDataChannel::connect(&offerer, &channel);
        self.lock_state().channel = Some(channel.clone());
        channel.mark_open();
        self.emit(ConnectionEvent::DataChannel(channel));
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(TransportError::Disconnected);
            }
            let channel = MockDataChannel::new(label);
            state.channel = Some(channel.clone());
            channel
        };
        self.emit(ConnectionEvent::NegotiationNeeded);
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let channel = self
            .lock_state()
            .channel
            .clone()
            .ok_or_else(|| TransportError::Negotiation("no data channel to offer".into()))?;
        let session = Uuid::new_v4().to_string();
        self.network
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.clone(), channel);
        self.lock_state().session = Some(session.clone());
        Ok(SessionDescription::offer(format!("{SESSION_PREFIX}{session}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.lock_state();
        match (&state.remote, &state.session) {
            (Some(remote), Some(session)) if remote.kind == SdpType::Offer => Ok(
                SessionDescription::answer(format!("{SESSION_PREFIX}{session}")),
            ),
            _ => Err(TransportError::Negotiation(
                "no remote offer to answer".into(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let is_answer = desc.kind == SdpType::Answer;
        let session = Self::session_of(&desc)?;
        self.lock_state().local = Some(desc);
        self.emit(ConnectionEvent::IceCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 1 127.0.0.1 0 typ {}",
                self.id.simple(),
                self.candidate_type
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
        if is_answer {
            self.pair_with_offerer(&session)?;
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let session = Self::session_of(&desc)?;
        match desc.kind {
            SdpType::Offer => {
                let mut state = self.lock_state();
                state.session = Some(session);
                state.remote = Some(desc);
            }
            SdpType::Answer => {
                let channel = {
                    let mut state = self.lock_state();
                    if state.session.as_deref() != Some(session.as_str()) {
                        return Err(TransportError::Negotiation(
                            "answer does not match our offer".into(),
                        ));
                    }
                    state.remote = Some(desc);
                    state.channel.clone()
                };
                if let Some(channel) = channel {
                    channel.mark_open();
                }
            }
            SdpType::Pranswer | SdpType::Rollback => {
                return Err(TransportError::Negotiation(format!(
                    "unsupported description type {:?}",
                    desc.kind
                )));
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        // Candidates carry nothing the in-memory pairing needs.
        if self.lock_state().closed {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<ConnectionEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn close(&self) {
        let channel = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.channel.take()
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.emit(ConnectionEvent::Closed);
    }
}
