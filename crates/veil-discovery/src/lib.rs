//! # VEIL Discovery
//!
//! Peer discovery for the VEIL network core.
//!
//! This crate provides:
//! - 256-bit node identifiers with the XOR distance metric
//! - A k-bucket routing table with probe-on-full replacement (k=20)
//! - Iterative lookup with α parallelism (α=3) and a round cap
//! - Relay control messages and relay selection
//!
//! Networking is left to the caller: the routing table is a plain data
//! structure, and lookups reach peers through the [`dht::FindNodeRpc`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dht;
pub mod error;
pub mod relay;

pub use dht::{Contact, NodeId, PeerRecord, RoutingTable};
pub use error::DiscoveryError;
