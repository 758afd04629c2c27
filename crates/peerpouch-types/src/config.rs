//! Configuration types for PeerPouch.
//!
//! Every field has a default so a partial (or missing) config file still
//! yields a usable configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerPouchConfig {
    /// Default tracing filter (overridden by `RUST_LOG`).
    pub log_level: String,
    /// Relay hub settings.
    pub hub: HubConfig,
    /// Peer transport settings.
    pub transport: TransportConfig,
}

impl Default for PeerPouchConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            hub: HubConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Relay hub settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Identity of the hub; a random one is generated when unset.
    pub id: Option<String>,
    /// Name announced for shares that do not set one.
    pub default_share_name: Option<String>,
}

/// Settings handed to the peer connection factory for every new link.
///
/// Only `channel_label` is used by the link itself. `ice_servers` and
/// `reliable` are hints for the factory; how far they are honoured depends on
/// the transport behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// STUN/TURN server URLs used for candidate gathering.
    pub ice_servers: Vec<String>,
    /// Label of the data channel the initiator opens.
    pub channel_label: String,
    /// Ask for a reliable, ordered channel.
    pub reliable: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:23.21.150.121".to_string()],
            channel_label: "peerpouch-dev".to_string(),
            reliable: true,
        }
    }
}
