//! # VEIL Core
//!
//! Node core for the VEIL decentralized RPC network.
//!
//! A [`Node`] owns one identity, one transport, a Kademlia routing table and
//! the authenticated channels to its peers. On top of that it provides:
//!
//! - Request/response RPC over multiplexed secure channels
//!   ([`Node::call`], [`Node::serve`])
//! - Peer discovery: bootstrap, iterative lookup, bucket refresh and pruning
//! - Relay fallback: when a peer cannot be dialed, traffic goes through a
//!   mutually reachable node that only ever sees ciphertext
//!
//! A remote call ends in exactly one of four ways: a response payload,
//! [`CallError::Application`], [`CallError::Timeout`] or
//! [`CallError::Unreachable`].
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use veil_core::{Node, NodeConfig};
//! use veil_core::rpc::{HandlerError, Request};
//!
//! # async fn example(peer: veil_discovery::NodeId) -> Result<(), Box<dyn std::error::Error>> {
//! let identity = veil_crypto::generate_identity()?;
//! let node = Node::bind_tcp(identity, "0.0.0.0:7400".parse()?, NodeConfig::default()).await?;
//!
//! node.serve("time", |_req: Request| async move {
//!     Ok::<_, HandlerError>(b"12:00".to_vec())
//! })?;
//!
//! node.bootstrap(&["198.51.100.4:7400".parse()?]).await;
//! let reply = node.call(&peer, "time", Vec::new(), Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod node;
pub mod rpc;

pub use config::{DhtConfig, NodeConfig, RelayConfig, RpcConfig};
pub use error::{CallError, NodeError, Result};
pub use node::{BootstrapReport, CallHandle, MaintenanceReport, Node, RelayedFrame, Route};
pub use veil_discovery::NodeId;
