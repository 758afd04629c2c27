//! Peer link negotiation and the RPC protocol spoken over it.
//!
//! - [`transport`]: the peer connection capability a link drives
//! - [`link`]: per-peer negotiation state machine
//! - [`signal`]: payloads relayed between links
//! - [`codec`] and [`value`]: call envelopes with function handles and blobs
//! - [`rpc`]: exposed-function registry and dispatch
//! - [`mock`]: in-memory transport

pub mod codec;
pub mod error;
pub mod link;
pub mod mock;
pub mod rpc;
pub mod signal;
pub mod transport;
pub mod value;

pub use error::{WireError, WireResult};
pub use link::{LinkEvent, LinkOptions, LinkRole, LinkState, PeerLink, Tube};
pub use mock::MockNetwork;
pub use rpc::{RpcHandler, BOOTSTRAP_FN};
pub use signal::SignalPayload;
pub use transport::{Frame, PeerConnectionFactory, TransportError};
pub use value::{Blob, Function, RpcValue};
