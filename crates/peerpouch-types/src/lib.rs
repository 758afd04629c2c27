//! Core types for PeerPouch.
//!
//! This crate defines the data structures shared by the wire protocol and the
//! hub-side share management: records persisted on the relay hub, the error
//! values that cross a peer link, and configuration. It contains no business
//! logic.

pub mod config;
pub mod error;
pub mod record;
