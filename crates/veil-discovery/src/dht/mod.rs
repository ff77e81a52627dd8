//! Kademlia-style distributed hash table routing.
//!
//! - [`NodeId`]: 256-bit identifiers and the XOR metric
//! - [`RoutingTable`]: k-buckets with probe-on-full replacement
//! - [`iterative_find`]: α-parallel lookup converging on the k closest peers

pub mod lookup;
pub mod node_id;
pub mod peer;
pub mod routing;

pub use lookup::{FindNodeRpc, LookupParams, LookupResult, iterative_find};
pub use node_id::NodeId;
pub use peer::{Contact, MAX_ADDRS_PER_PEER, PeerRecord};
pub use routing::{InsertOutcome, K, KBucket, NUM_BUCKETS, RoutingSnapshot, RoutingTable};

use std::time::Duration;

/// Lookup parallelism
pub const ALPHA: usize = 3;

/// Round cap for a single iterative lookup
pub const MAX_ROUNDS: usize = 20;

/// Default timeout for one remote FIND_NODE query
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
