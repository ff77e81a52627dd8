//! In-memory mesh fixture.
//!
//! Spawns any number of nodes on one [`MemoryNetwork`], so tests can shape
//! reachability with partitions instead of real sockets.
//!
//! # Example
//!
//! ```no_run
//! use veil_integration_tests::MeshFixture;
//! use veil_core::NodeConfig;
//!
//! # async fn example() -> Result<(), veil_core::NodeError> {
//! let mesh = MeshFixture::bootstrapped(8, NodeConfig::default()).await?;
//! assert_eq!(mesh.len(), 8);
//! mesh.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use veil_core::{Node, NodeConfig, NodeError};
use veil_transport::memory::MemoryNetwork;

/// A set of nodes sharing one in-memory network.
pub struct MeshFixture {
    /// The network all nodes are bound to
    pub net: MemoryNetwork,
    /// Nodes, in spawn order
    pub nodes: Vec<Node>,
}

impl MeshFixture {
    /// Spawn `count` unconnected nodes.
    ///
    /// # Errors
    ///
    /// Returns the first node start failure.
    pub async fn new(count: usize, config: NodeConfig) -> Result<Self, NodeError> {
        let net = MemoryNetwork::default();
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(spawn_node(&net, config.clone()).await?);
        }
        Ok(Self { net, nodes })
    }

    /// Spawn `count` nodes and bootstrap every node after the first through
    /// the first.
    ///
    /// # Errors
    ///
    /// Returns the first node start failure, or `PeerUnreachable` if a node
    /// could not reach the seed.
    pub async fn bootstrapped(count: usize, config: NodeConfig) -> Result<Self, NodeError> {
        let mesh = Self::new(count, config).await?;
        if let Some((seed, rest)) = mesh.nodes.split_first() {
            let seed_addr = seed.local_addr();
            for node in rest {
                if !node.bootstrap(&[seed_addr]).await.joined() {
                    return Err(NodeError::unreachable("seed did not answer"));
                }
            }
        }
        Ok(mesh)
    }

    /// Add one more node to the network.
    ///
    /// # Errors
    ///
    /// Returns the node start failure.
    pub async fn spawn(&mut self, config: NodeConfig) -> Result<&Node, NodeError> {
        let node = spawn_node(&self.net, config).await?;
        self.nodes.push(node);
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    /// Node by spawn index
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the mesh has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Make nodes `a` and `b` unable to dial each other.
    pub fn partition(&self, a: usize, b: usize) {
        self.net
            .partition(self.nodes[a].local_addr(), self.nodes[b].local_addr());
    }

    /// Shut every node down.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Start one node on `net` with a fresh identity.
///
/// # Errors
///
/// Returns identity, bind or config failures.
pub async fn spawn_node(net: &MemoryNetwork, config: NodeConfig) -> Result<Node, NodeError> {
    let identity = veil_crypto::generate_identity()?;
    let transport = Arc::new(net.bind_any()?);
    let node = Node::start(identity, transport, config).await?;
    tracing::debug!(node = %node.local_id(), addr = %node.local_addr(), "Mesh node up");
    Ok(node)
}

/// Config with lookup and probe timers short enough for tests.
pub fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.dht.query_timeout = Duration::from_secs(2);
    config.dht.probe_timeout = Duration::from_millis(500);
    config
}
