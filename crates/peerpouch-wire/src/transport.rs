//! Peer transport capability.
//!
//! Abstracts the peer connection (session negotiation, candidate gathering)
//! and its data channel so the link state machine works the same over a real
//! WebRTC stack or the in-memory [`crate::mock`] network.

use async_trait::async_trait;
use bytes::Bytes;
use peerpouch_types::config::TransportConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors from the underlying peer transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
}

/// One unit on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description (offer or answer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network candidate discovered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

/// Events raised by a peer connection.
pub enum ConnectionEvent {
    /// The connection wants a (re)negotiation; the initiator should offer.
    NegotiationNeeded,
    /// A local candidate was found and must reach the peer.
    IceCandidate(IceCandidate),
    /// The remote side announced a data channel.
    DataChannel(Arc<dyn DataChannel>),
    /// The connection failed or was closed.
    Closed,
}

/// Events raised by a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is open for sending.
    Open,
    /// A message arrived.
    Message(Frame),
    /// The channel closed.
    Closed,
}

/// Reliable, ordered point-to-point channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label.
    fn label(&self) -> &str;

    /// Send one frame to the peer. Fails unless the channel is open.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Wait for the next channel event. `None` once the channel is gone.
    async fn recv(&self) -> Option<ChannelEvent>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Close the channel.
    async fn close(&self);
}

/// A peer connection with built-in negotiation.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open a local data channel (initiator side).
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Wait for the next connection event. `None` once the connection is gone.
    async fn next_event(&self) -> Option<ConnectionEvent>;

    /// Tear the connection down.
    async fn close(&self);
}

/// Creates peer connections, one per link.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
