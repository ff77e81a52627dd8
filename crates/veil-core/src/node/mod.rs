//! Node orchestration layer
//!
//! The [`Node`] is an explicit context value tying together everything one
//! VEIL node owns:
//! - its identity and transport
//! - the routing table (behind a `tokio::sync::RwLock`)
//! - the channel registry (`DashMap<NodeId, ChannelEntry>`)
//! - the pending-call table
//!
//! No code path holds more than one of those three at a time; values are
//! cloned out before awaiting or touching another structure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Node API                           │
//! │        call / start_call / serve / bootstrap             │
//! ├─────────────────────────────────────────────────────────┤
//! │  RPC dispatch  │  Discovery  │  Relay  │  Channel registry│
//! ├─────────────────────────────────────────────────────────┤
//! │   SecureChannel (veil-transport)  │  RoutingTable (dht)  │
//! ├─────────────────────────────────────────────────────────┤
//! │            Transport (TCP / in-memory)                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use veil_core::{Node, NodeConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = veil_crypto::generate_identity()?;
//!     let node = Node::bind_tcp(identity, "0.0.0.0:7400".parse()?, NodeConfig::default()).await?;
//!
//!     node.serve("echo", |req: veil_core::rpc::Request| async move {
//!         Ok::<_, veil_core::rpc::HandlerError>(req.payload)
//!     })?;
//!
//!     node.bootstrap(&["203.0.113.7:7400".parse()?]).await;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod channels;
pub mod discovery;
#[allow(clippy::module_inception)]
pub mod node;
pub mod relay;

pub use call::CallHandle;
pub use channels::Route;
pub use discovery::{BootstrapReport, DHT_FIND_NODE, DHT_PING, MaintenanceReport};
pub use node::Node;
pub use relay::RelayedFrame;

#[cfg(test)]
pub(crate) mod test_util {
    use super::Node;
    use crate::config::NodeConfig;
    use std::sync::{Arc, Once};
    use veil_transport::memory::MemoryNetwork;

    static TRACING: Once = Once::new();

    /// Log to the test writer; `RUST_LOG` picks the level.
    pub(crate) fn init_tracing() {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    /// Start a node on `net` with a fresh identity.
    pub(crate) async fn spawn_node(net: &MemoryNetwork, config: NodeConfig) -> Node {
        init_tracing();
        let identity = veil_crypto::generate_identity().unwrap();
        let transport = Arc::new(net.bind_any().unwrap());
        Node::start(identity, transport, config).await.unwrap()
    }

    /// Config with short timers for tests.
    pub(crate) fn fast_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.dht.query_timeout = std::time::Duration::from_secs(2);
        config.dht.probe_timeout = std::time::Duration::from_millis(500);
        config
    }
}
