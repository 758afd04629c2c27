//! Share discovery and remote database access through a relay hub.
//!
//! A hub is a shared document store every endpoint can read and write. Shares
//! are announced as records on it and link negotiation is relayed through it
//! as signal records; once a link is up, the shared database is driven over
//! RPC.

pub mod config;
pub mod database;
pub mod directory;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod peer_db;
pub mod share;
pub mod store;
pub mod watch;

pub use database::{ChangesHandle, ChangesOptions, Database, DbResult};
pub use directory::ShareDirectory;
pub use error::{HubError, HubResult};
pub use memory::MemoryHub;
pub use memory_db::MemoryDatabase;
pub use peer_db::PeerDatabase;
pub use share::{ConnectOptions, RemotePeer, ShareDescriptor, ShareManager, ShareOptions};
pub use store::RelayStore;
pub use watch::{ChangeMultiplexer, FeedStatus, Watcher};
