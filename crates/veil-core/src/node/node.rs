//! Node context and lifecycle.

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::node::channels::ChannelEntry;
use crate::node::relay::{RelayedFrame, TunnelLeg};
use crate::rpc::{CallId, PendingCalls, RpcHandler};
use dashmap::{DashMap, DashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, broadcast, watch};
use veil_crypto::{NodeIdentity, PublicIdentity};
use veil_discovery::dht::{Contact, RoutingSnapshot, RoutingTable};
use veil_discovery::relay::TunnelId;
use veil_discovery::NodeId;
use veil_transport::tcp::TcpTransport;
use veil_transport::{SecureChannel, Transport};

/// Upper bound for closing one channel during shutdown
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Node inner state
pub(crate) struct NodeInner {
    /// Node identity
    pub(crate) identity: NodeIdentity,
    /// Our node ID
    pub(crate) local_id: NodeId,
    /// Listen address advertised to peers
    pub(crate) local_addr: SocketAddr,
    /// Node configuration
    pub(crate) config: NodeConfig,
    /// Transport layer
    pub(crate) transport: Arc<dyn Transport>,
    /// DHT routing table
    pub(crate) routing: RwLock<RoutingTable>,
    /// Live channels (peer -> channel)
    pub(crate) channels: DashMap<NodeId, ChannelEntry>,
    /// Outstanding calls
    pub(crate) pending: Arc<PendingCalls>,
    /// Registered methods
    pub(crate) handlers: DashMap<String, Arc<dyn RpcHandler>>,
    /// Tunnel legs keyed by (channel peer, tunnel id on that leg)
    pub(crate) tunnels: DashMap<(NodeId, TunnelId), TunnelLeg>,
    /// Bucket-full probes in flight, by the probed peer
    pub(crate) probing: DashSet<NodeId>,
    /// Copies of forwarded relay frames
    pub(crate) relay_traffic: broadcast::Sender<RelayedFrame>,
    /// Flips to true once on shutdown
    pub(crate) shutdown: watch::Sender<bool>,
    /// Node running state
    pub(crate) running: AtomicBool,
}

/// A VEIL node.
///
/// Cheap to clone; all clones share one context. Every operation takes the
/// node explicitly, there is no process-wide state.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.inner.local_id)
            .field("addr", &self.inner.local_addr)
            .field("channels", &self.inner.channels.len())
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start a node on an already bound transport.
    ///
    /// Spawns the accept loop, the call sweeper and the routing maintenance
    /// loop. Bootstrapping is left to the caller (see [`Node::bootstrap`]).
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if `config` fails validation, or a
    /// transport error if the local address cannot be determined.
    pub async fn start(
        identity: NodeIdentity,
        transport: Arc<dyn Transport>,
        config: NodeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let local_addr = transport.local_addr()?;
        let local_id = NodeId::from_bytes(*identity.node_id());

        let (shutdown, _) = watch::channel(false);
        let (relay_traffic, _) = broadcast::channel(config.relay.traffic_buffer.max(1));

        let inner = NodeInner {
            identity,
            local_id,
            local_addr,
            routing: RwLock::new(RoutingTable::with_k(local_id, config.dht.k)),
            config,
            transport,
            channels: DashMap::new(),
            pending: Arc::new(PendingCalls::new()),
            handlers: DashMap::new(),
            tunnels: DashMap::new(),
            probing: DashSet::new(),
            relay_traffic,
            shutdown,
            running: AtomicBool::new(true),
        };
        let node = Self {
            inner: Arc::new(inner),
        };

        tokio::spawn(node.clone().accept_loop());
        tokio::spawn(node.clone().sweep_loop());
        tokio::spawn(node.clone().maintenance_loop());

        tracing::info!(node = %local_id, addr = %local_addr, "Node started");
        Ok(node)
    }

    /// Bind a TCP listener on `addr` and start a node on it.
    ///
    /// # Errors
    ///
    /// Fails like [`Node::start`], or if the socket cannot be bound.
    pub async fn bind_tcp(
        identity: NodeIdentity,
        addr: SocketAddr,
        config: NodeConfig,
    ) -> Result<Self> {
        let transport = TcpTransport::bind(addr, config.channel.max_frame_size)
            .await?
            .with_connect_timeout(config.connect_timeout);
        Self::start(identity, Arc::new(transport), config).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Our node ID
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    /// Our public identity (node ID and Ed25519 key)
    #[must_use]
    pub fn local_identity(&self) -> PublicIdentity {
        self.inner.identity.public()
    }

    /// Address the transport listens on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// What we tell other nodes about ourselves: the configured advertised
    /// addresses, or else the listen address.
    #[must_use]
    pub fn contact(&self) -> Contact {
        let addrs = if self.inner.config.advertised_addrs.is_empty() {
            vec![self.inner.local_addr]
        } else {
            self.inner.config.advertised_addrs.clone()
        };
        Contact::new(self.inner.local_id, addrs)
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Check if node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a response
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether `call_id` is still waiting for a response
    #[must_use]
    pub fn is_pending(&self, call_id: CallId) -> bool {
        self.inner.pending.contains(call_id)
    }

    /// Peers in the routing table
    pub async fn routing_len(&self) -> usize {
        self.inner.routing.read().await.len()
    }

    /// Contacts of the routing table, nearest to `target` first
    pub async fn closest_known(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.inner
            .routing
            .read()
            .await
            .lookup(target, count)
            .iter()
            .map(|peer| peer.contact())
            .collect()
    }

    /// Serializable copy of the routing table
    pub async fn routing_snapshot(&self) -> RoutingSnapshot {
        self.inner.routing.read().await.snapshot()
    }

    /// Load a snapshot taken by this node into the routing table.
    ///
    /// Returns the number of entries inserted. Restored entries start with a
    /// fresh failure count and are re-validated by normal traffic.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` if the snapshot belongs to another
    /// node ID.
    pub async fn restore_routing(&self, snapshot: &RoutingSnapshot) -> Result<usize> {
        let restored = self.inner.routing.write().await.restore(snapshot)?;
        tracing::info!(restored, "Routing table restored");
        Ok(restored)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Stop the node.
    ///
    /// Closes the transport and every channel, drops all tunnels, and fails
    /// every outstanding call. Idempotent.
    pub async fn shutdown(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.inner.shutdown.send_replace(true);

        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!(error = %e, "Error closing transport");
        }

        let channels: Vec<Arc<SecureChannel>> = self
            .inner
            .channels
            .iter()
            .map(|entry| Arc::clone(&entry.channel))
            .collect();
        for channel in channels {
            if tokio::time::timeout(CLOSE_TIMEOUT, channel.close())
                .await
                .is_err()
            {
                tracing::debug!(channel = %hex::encode(channel.channel_id()), "Close timed out");
            }
        }
        self.inner.channels.clear();
        self.inner.tunnels.clear();

        let failed = self
            .inner
            .pending
            .fail_all(&NodeError::invalid_state("node shut down"));

        tracing::info!(node = %self.inner.local_id, failed_calls = failed, "Node stopped");
    }

    /// Resolves once [`Node::shutdown`] has been called.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        // A closed sender means the context is gone; treat it as stopped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NodeError::invalid_state("node shut down"))
        }
    }

    /// Resolve expired calls every `rpc.sweep_interval`.
    async fn sweep_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.rpc.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stopped() => break,
                _ = ticker.tick() => {
                    let swept = self.inner.pending.sweep(Instant::now());
                    if swept > 0 {
                        tracing::trace!(swept, "Swept expired calls");
                    }
                }
            }
        }
    }
}
