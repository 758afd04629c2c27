//! Connection state machine.
//!
//! A [`PeerLink`] owns one peer connection and drives it from `Init` through
//! `Negotiating` to `Connected`, then `Closed`. It knows nothing about how its
//! signals reach the peer: every offer, answer and candidate it produces is
//! emitted as [`LinkEvent::Signal`], and whatever the peer sends back is fed in
//! through [`PeerLink::receive_signal`]. Once the data channel opens the link
//! emits [`LinkEvent::Connected`] with a [`Tube`] for message passing.

use crate::error::{WireError, WireResult};
use crate::signal::SignalPayload;
use crate::transport::{
    ChannelEvent, ConnectionEvent, DataChannel, Frame, PeerConnection, SdpType,
};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Which side of the negotiation a link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Opens the data channel and sends the offer.
    Initiator,
    /// Waits for an offer and a channel announcement.
    Responder,
}

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Init,
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Init => "init",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identity and role of a new link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub role: LinkRole,
    /// Our endpoint identity (used for logging).
    pub local_id: String,
    /// The peer's endpoint identity.
    pub peer_id: String,
    /// Label for the data channel opened by an initiator.
    pub label: String,
}

/// What a link asks its owner to do.
pub enum LinkEvent {
    /// Relay this payload to the peer.
    Signal(SignalPayload),
    /// The data channel is open.
    Connected(Tube),
    /// The link is closed for good.
    Closed,
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Signal(payload) => f.debug_tuple("Signal").field(payload).finish(),
            LinkEvent::Connected(_) => f.write_str("Connected"),
            LinkEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// Duplex message passing over a connected link.
pub struct Tube {
    channel: Arc<dyn DataChannel>,
    incoming: mpsc::UnboundedReceiver<Frame>,
}

impl Tube {
    pub fn new(channel: Arc<dyn DataChannel>, incoming: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { channel, incoming }
    }

    /// Wrap an already-open channel, forwarding its messages until it closes.
    pub fn attach(channel: Arc<dyn DataChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = channel.clone();
        tokio::spawn(async move {
            while let Some(event) = reader.recv().await {
                match event {
                    ChannelEvent::Message(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    ChannelEvent::Open => {}
                    ChannelEvent::Closed => break,
                }
            }
        });
        Self::new(channel, rx)
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    pub fn into_parts(self) -> (Arc<dyn DataChannel>, mpsc::UnboundedReceiver<Frame>) {
        (self.channel, self.incoming)
    }
}

/// One negotiated connection to one peer.
#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    role: LinkRole,
    local_id: String,
    peer_id: String,
    conn: Arc<dyn PeerConnection>,
    state: RwLock<LinkState>,
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    /// Dropped on close so the tube's stream ends.
    frames_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    frames_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
}

impl PeerLink {
    /// Start driving `conn`.
    ///
    /// An initiator opens its data channel right away, which makes the
    /// connection ask for negotiation. A responder waits for the peer's offer
    /// and channel announcement. The returned receiver yields everything the
    /// owner must act on.
    pub async fn open(
        conn: Arc<dyn PeerConnection>,
        options: LinkOptions,
    ) -> WireResult<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(LinkInner {
            role: options.role,
            local_id: options.local_id,
            peer_id: options.peer_id,
            conn: conn.clone(),
            state: RwLock::new(LinkState::Init),
            channel: RwLock::new(None),
            events,
            frames_tx: Mutex::new(Some(frames_tx)),
            frames_rx: Mutex::new(Some(frames_rx)),
        });

        if inner.role == LinkRole::Initiator {
            let channel = conn.create_data_channel(&options.label).await?;
            LinkInner::attach_channel(&inner, channel);
        }

        let driver = inner.clone();
        tokio::spawn(async move { LinkInner::drive(driver).await });

        Ok((Self { inner }, events_rx))
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn role(&self) -> LinkRole {
        self.inner.role
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Apply a payload relayed from the peer.
    ///
    /// A description is applied as the remote description, and answered if it
    /// was an offer. A candidate is added to the connection. Anything that
    /// does not parse or cannot be applied is logged and dropped.
    pub async fn receive_signal(&self, data: &Value) {
        let inner = &self.inner;
        if self.state() == LinkState::Closed {
            debug!(local = %inner.local_id, peer = %inner.peer_id, "Ignoring signal for closed link");
            return;
        }
        let payload = match SignalPayload::from_value(data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(local = %inner.local_id, peer = %inner.peer_id, error = %e, "Dropping unrecognised signal");
                return;
            }
        };
        debug!(local = %inner.local_id, peer = %inner.peer_id, ?payload, "Received signal");

        match payload {
            SignalPayload::Description(desc) => {
                inner.advance(LinkState::Negotiating);
                let needs_answer = desc.kind == SdpType::Offer;
                if let Err(e) = inner.conn.set_remote_description(desc).await {
                    warn!(local = %inner.local_id, error = %e, "Couldn't set remote description");
                    return;
                }
                if needs_answer {
                    inner.answer().await;
                }
            }
            SignalPayload::Candidate { candidate } => {
                if let Err(e) = inner.conn.add_ice_candidate(candidate).await {
                    warn!(local = %inner.local_id, error = %e, "Couldn't add candidate");
                }
            }
        }
    }

    /// Send one frame. Fails unless the link is connected.
    pub async fn send(&self, frame: Frame) -> WireResult<()> {
        if self.state() != LinkState::Connected {
            return Err(WireError::NotConnected);
        }
        let channel = self
            .inner
            .channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(WireError::NotConnected)?;
        channel.send(frame).await?;
        Ok(())
    }

    /// Close the channel and the connection.
    pub async fn close(&self) {
        let channel = self
            .inner
            .channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.inner.conn.close().await;
        self.inner.mark_closed();
    }
}

impl LinkInner {
    /// Move forward to `next` unless already there, past it, or closed.
    fn advance(&self, next: LinkState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let rank = |s: LinkState| match s {
            LinkState::Init => 0,
            LinkState::Negotiating => 1,
            LinkState::Connected => 2,
            LinkState::Closed => 3,
        };
        if rank(next) > rank(*state) {
            *state = next;
        }
    }

    fn mark_closed(&self) {
        let was = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, LinkState::Closed)
        };
        self.frames_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if was != LinkState::Closed {
            info!(local = %self.local_id, peer = %self.peer_id, "Link closed");
            let _ = self.events.send(LinkEvent::Closed);
        }
    }

    fn emit_signal(&self, payload: SignalPayload) {
        let _ = self.events.send(LinkEvent::Signal(payload));
    }

    async fn offer(&self) {
        let offer = match self.conn.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(local = %self.local_id, error = %e, "Failed to create offer");
                return;
            }
        };
        if let Err(e) = self.conn.set_local_description(offer.clone()).await {
            warn!(local = %self.local_id, error = %e, "Failed to set local offer");
            return;
        }
        self.advance(LinkState::Negotiating);
        debug!(local = %self.local_id, peer = %self.peer_id, "Created offer, sending");
        self.emit_signal(SignalPayload::Description(offer));
    }

    async fn answer(&self) {
        let answer = match self.conn.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(local = %self.local_id, error = %e, "Couldn't create answer");
                return;
            }
        };
        if let Err(e) = self.conn.set_local_description(answer.clone()).await {
            warn!(local = %self.local_id, error = %e, "Failed to set local answer");
            return;
        }
        debug!(local = %self.local_id, peer = %self.peer_id, "Created answer, sending");
        self.emit_signal(SignalPayload::Description(answer));
    }

    /// Connection event loop.
    async fn drive(inner: Arc<LinkInner>) {
        while let Some(event) = inner.conn.next_event().await {
            if *inner.state.read().unwrap_or_else(|e| e.into_inner()) == LinkState::Closed {
                break;
            }
            match event {
                ConnectionEvent::NegotiationNeeded => {
                    debug!(local = %inner.local_id, "Negotiation needed");
                    inner.offer().await;
                }
                ConnectionEvent::IceCandidate(candidate) => {
                    inner.emit_signal(SignalPayload::Candidate { candidate });
                }
                ConnectionEvent::DataChannel(channel) => {
                    debug!(local = %inner.local_id, label = channel.label(), "Received data channel");
                    LinkInner::attach_channel(&inner, channel);
                }
                ConnectionEvent::Closed => break,
            }
        }
        inner.mark_closed();
    }

    fn attach_channel(inner: &Arc<LinkInner>, channel: Arc<dyn DataChannel>) {
        *inner.channel.write().unwrap_or_else(|e| e.into_inner()) = Some(channel.clone());
        let reader = inner.clone();
        tokio::spawn(async move { reader.read_channel(channel).await });
    }

    /// Channel event loop.
    async fn read_channel(&self, channel: Arc<dyn DataChannel>) {
        while let Some(event) = channel.recv().await {
            match event {
                ChannelEvent::Open => {
                    self.advance(LinkState::Connected);
                    let incoming = self
                        .frames_rx
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take();
                    if let Some(incoming) = incoming {
                        info!(local = %self.local_id, peer = %self.peer_id, "Data channel is open");
                        let tube = Tube::new(channel.clone(), incoming);
                        let _ = self.events.send(LinkEvent::Connected(tube));
                    }
                }
                ChannelEvent::Message(frame) => {
                    let frames = self.frames_tx.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(frames) = frames.as_ref() {
                        let _ = frames.send(frame);
                    }
                }
                ChannelEvent::Closed => break,
            }
        }
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;
    use crate::transport::PeerConnectionFactory;
    use peerpouch_types::config::TransportConfig;
    use serde_json::json;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("link event stream ended")
    }

    fn options(role: LinkRole, local: &str, peer: &str) -> LinkOptions {
        LinkOptions {
            role,
            local_id: local.to_string(),
            peer_id: peer.to_string(),
            label: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initiator_emits_offer() {
        let network = MockNetwork::new();
        let conn = network.create(&TransportConfig::default()).await.unwrap();
        let (link, mut events) = PeerLink::open(conn, options(LinkRole::Initiator, "p1", "share-1"))
            .await
            .unwrap();

        match next_event(&mut events).await {
            LinkEvent::Signal(SignalPayload::Description(desc)) => {
                assert_eq!(desc.kind, SdpType::Offer)
            }
            other => panic!("Expected offer, got {other:?}"),
        }
        assert_eq!(link.state(), LinkState::Negotiating);
        assert!(matches!(
            link.send(Frame::Text("early".into())).await,
            Err(WireError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_full_negotiation_reaches_connected() {
        let network = MockNetwork::new();
        let config = TransportConfig::default();
        let (a, mut a_events) = PeerLink::open(
            network.create(&config).await.unwrap(),
            options(LinkRole::Initiator, "p1", "share-1"),
        )
        .await
        .unwrap();
        let (b, mut b_events) = PeerLink::open(
            network.create(&config).await.unwrap(),
            options(LinkRole::Responder, "share-1", "p1"),
        )
        .await
        .unwrap();

        // Relay signals by hand until both sides report a tube.
        let mut a_tube = None;
        let mut b_tube = None;
        while a_tube.is_none() || b_tube.is_none() {
            tokio::select! {
                event = next_event(&mut a_events) => match event {
                    LinkEvent::Signal(payload) => b.receive_signal(&payload.to_value()).await,
                    LinkEvent::Connected(tube) => a_tube = Some(tube),
                    LinkEvent::Closed => panic!("initiator closed"),
                },
                event = next_event(&mut b_events) => match event {
                    LinkEvent::Signal(payload) => a.receive_signal(&payload.to_value()).await,
                    LinkEvent::Connected(tube) => b_tube = Some(tube),
                    LinkEvent::Closed => panic!("responder closed"),
                },
            }
        }
        assert_eq!(a.state(), LinkState::Connected);
        assert_eq!(b.state(), LinkState::Connected);

        a.send(Frame::Text("hello".into())).await.unwrap();
        let (_, mut b_incoming) = b_tube.unwrap().into_parts();
        assert_eq!(b_incoming.recv().await, Some(Frame::Text("hello".into())));

        a.close().await;
        assert_eq!(a.state(), LinkState::Closed);
        assert!(a.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_responder_answers_offer_once() {
        let network = MockNetwork::new();
        let config = TransportConfig::default();
        let (_a, mut a_events) = PeerLink::open(
            network.create(&config).await.unwrap(),
            options(LinkRole::Initiator, "p1", "share-1"),
        )
        .await
        .unwrap();
        let offer = match next_event(&mut a_events).await {
            LinkEvent::Signal(payload) => payload,
            other => panic!("Expected offer, got {other:?}"),
        };

        let (b, mut b_events) = PeerLink::open(
            network.create(&config).await.unwrap(),
            options(LinkRole::Responder, "share-1", "p1"),
        )
        .await
        .unwrap();
        assert_eq!(b.state(), LinkState::Init);
        b.receive_signal(&offer.to_value()).await;

        let mut answers = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), b_events.recv()).await
        {
            if let LinkEvent::Signal(SignalPayload::Description(desc)) = event {
                assert_eq!(desc.kind, SdpType::Answer);
                answers += 1;
            }
        }
        assert_eq!(answers, 1);
    }

    #[tokio::test]
    async fn test_malformed_signal_is_dropped() {
        let network = MockNetwork::new();
        let (link, _events) = PeerLink::open(
            network.create(&TransportConfig::default()).await.unwrap(),
            options(LinkRole::Responder, "share-1", "p1"),
        )
        .await
        .unwrap();
        link.receive_signal(&json!({"nonsense": true})).await;
        link.receive_signal(&json!({"candidate": {"candidate": "c"}})).await;
        assert_eq!(link.state(), LinkState::Init);
    }
}
