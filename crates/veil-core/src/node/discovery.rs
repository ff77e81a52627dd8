//! Discovery integration for the node.
//!
//! Serves the built-in `dht.ping` and `dht.find_node` methods, keeps the
//! routing table fed from authenticated traffic, and runs lookups, bootstrap
//! and periodic maintenance.

use crate::error::{NodeError, Result};
use crate::node::Node;
use crate::rpc::{Envelope, Status};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use veil_discovery::dht::{
    Contact, FindNodeRpc, InsertOutcome, LookupResult, PeerRecord, iterative_find,
};
use veil_discovery::{DiscoveryError, NodeId};

/// Liveness check; request and response carry the sender's contact
pub const DHT_PING: &str = "dht.ping";

/// Closest-contacts query
pub const DHT_FIND_NODE: &str = "dht.find_node";

#[derive(Debug, Serialize, Deserialize)]
struct PingMessage {
    contact: Contact,
}

#[derive(Debug, Serialize, Deserialize)]
struct FindNodeRequest {
    sender: Contact,
    target: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
struct FindNodeResponse {
    closest: Vec<Contact>,
}

/// Outcome of [`Node::bootstrap`]
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    /// Seeds that answered, by node ID
    pub contacted: Vec<NodeId>,
    /// Seeds that could not be reached
    pub failed: Vec<SocketAddr>,
    /// Routing table size afterwards
    pub known_peers: usize,
    /// Rounds of the self-lookup
    pub rounds: usize,
    /// The self-lookup hit its round cap
    pub exhausted: bool,
}

impl BootstrapReport {
    /// Whether at least one seed answered
    #[must_use]
    pub fn joined(&self) -> bool {
        !self.contacted.is_empty()
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Buckets refreshed with a random-target lookup
    pub refreshed: usize,
    /// Peers dropped for repeated failures
    pub pruned: Vec<NodeId>,
    /// The table was empty and the configured seeds were retried
    pub rebootstrapped: bool,
}

/// FIND_NODE over node channels, for [`iterative_find`].
struct NodeRpc {
    node: Node,
}

#[async_trait]
impl FindNodeRpc for NodeRpc {
    async fn find_node(
        &self,
        peer: &Contact,
        target: NodeId,
    ) -> std::result::Result<Vec<Contact>, DiscoveryError> {
        self.node
            .query_find_node(peer, target)
            .await
            .map_err(|e| match e {
                NodeError::Timeout(_) => DiscoveryError::Timeout,
                other => DiscoveryError::RpcFailed(other.to_string()),
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Built-in methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Answer `dht.*` requests. Returns `None` for any other method.
    pub(crate) async fn handle_dht_request(
        &self,
        peer: NodeId,
        seen_from: Option<SocketAddr>,
        request: &Envelope,
    ) -> Option<Envelope> {
        let response = match request.method.as_str() {
            DHT_PING => match bincode::deserialize::<PingMessage>(&request.payload) {
                Ok(ping) => {
                    self.observe_sender(peer, seen_from, &ping.contact).await;
                    self.encode_reply(request, &PingMessage {
                        contact: self.contact(),
                    })
                }
                Err(e) => Envelope::error_response(request, Status::BadRequest, &e.to_string()),
            },
            DHT_FIND_NODE => match bincode::deserialize::<FindNodeRequest>(&request.payload) {
                Ok(query) => {
                    self.observe_sender(peer, seen_from, &query.sender).await;
                    let closest = self
                        .closest_known(&query.target, self.inner.config.dht.k)
                        .await;
                    self.encode_reply(request, &FindNodeResponse { closest })
                }
                Err(e) => Envelope::error_response(request, Status::BadRequest, &e.to_string()),
            },
            _ => return None,
        };
        Some(response)
    }

    fn encode_reply<T: Serialize>(&self, request: &Envelope, body: &T) -> Envelope {
        match bincode::serialize(body) {
            Ok(payload) => Envelope::response(request, Status::Ok, payload),
            Err(e) => Envelope::error_response(request, Status::ApplicationError(0), &e.to_string()),
        }
    }

    /// Learn a contact a peer sent about itself.
    ///
    /// Only accepted when it names the authenticated channel peer.
    async fn observe_sender(
        &self,
        peer: NodeId,
        seen_from: Option<SocketAddr>,
        contact: &Contact,
    ) {
        if contact.id == peer {
            self.observe(&resolve_advertised(contact, seen_from), None).await;
        } else {
            tracing::debug!(%peer, claimed = %contact.id, "Ignoring contact for another node");
        }
    }
}

/// A peer's self-reported contact with wildcard IPs (a node listening on
/// `0.0.0.0`) replaced by the IP its link came from. The advertised port is
/// kept. Wildcard addresses are dropped when the link has no IP, as with a
/// relay tunnel.
pub(crate) fn resolve_advertised(contact: &Contact, seen_from: Option<SocketAddr>) -> Contact {
    let mut addrs = Vec::with_capacity(contact.addrs.len());
    for addr in &contact.addrs {
        let resolved = if addr.ip().is_unspecified() {
            match seen_from {
                Some(seen) => SocketAddr::new(seen.ip(), addr.port()),
                None => continue,
            }
        } else {
            *addr
        };
        if !addrs.contains(&resolved) {
            addrs.push(resolved);
        }
    }
    Contact::new(contact.id, addrs)
}

// ═══════════════════════════════════════════════════════════════════════════
// Routing table upkeep
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Record a peer that just proved to be alive.
    ///
    /// When its bucket is full, the bucket's least-recently-seen entry is
    /// pinged in the background and replaced only if it fails to answer.
    pub(crate) async fn observe(&self, contact: &Contact, rtt: Option<Duration>) {
        if contact.id == self.inner.local_id {
            return;
        }

        let full = {
            let mut routing = self.inner.routing.write().await;
            match routing.insert(PeerRecord::from_contact(contact)) {
                InsertOutcome::Inserted => {
                    routing.record_success(&contact.id, rtt);
                    tracing::debug!(peer = %contact.id, "Peer added to routing table");
                    None
                }
                InsertOutcome::Updated => {
                    routing.record_success(&contact.id, rtt);
                    None
                }
                InsertOutcome::Full { lru, candidate } => Some((lru, candidate)),
                InsertOutcome::Rejected => None,
            }
        };

        if let Some((lru, candidate)) = full {
            self.spawn_probe(lru, candidate);
        }
    }

    fn spawn_probe(&self, lru: PeerRecord, candidate: PeerRecord) {
        // One probe per stale entry; later candidates for the bucket are dropped.
        if !self.inner.probing.insert(lru.id) {
            return;
        }

        let node = self.clone();
        tokio::spawn(async move {
            let timeout = node.inner.config.dht.probe_timeout;
            let alive = node
                .ping_with_hints(&lru.id, &lru.addrs, timeout)
                .await
                .is_ok();
            let candidate_id = candidate.id;
            let inserted = node
                .inner
                .routing
                .write()
                .await
                .resolve_probe(&lru.id, alive, candidate);
            node.inner.probing.remove(&lru.id);

            tracing::debug!(
                probed = %lru.id,
                alive,
                candidate = %candidate_id,
                inserted,
                "Bucket probe resolved"
            );
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Ping `peer` and return the round-trip time.
    ///
    /// # Errors
    ///
    /// Fails like [`Node::call`].
    pub async fn ping(
        &self,
        peer: &NodeId,
        timeout: Duration,
    ) -> std::result::Result<Duration, crate::CallError> {
        let handle = self
            .issue(peer, &[], true, DHT_PING, self.ping_payload()?, timeout)
            .await?;
        Ok(self.finish_ping(peer, handle).await?)
    }

    /// Ping over a known address, without running a lookup.
    pub(crate) async fn ping_with_hints(
        &self,
        peer: &NodeId,
        hints: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Duration> {
        let handle = self
            .issue(peer, hints, false, DHT_PING, self.ping_payload()?, timeout)
            .await?;
        self.finish_ping(peer, handle).await
    }

    fn ping_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&PingMessage {
            contact: self.contact(),
        })?)
    }

    async fn finish_ping(&self, peer: &NodeId, handle: crate::CallHandle) -> Result<Duration> {
        let sent = Instant::now();
        let reply = handle.resolve().await?;
        let rtt = sent.elapsed();

        let pong: PingMessage = bincode::deserialize(&reply)?;
        if pong.contact.id == *peer {
            let seen_from = self.open_channel(peer).and_then(|channel| channel.peer_addr());
            self.observe(&resolve_advertised(&pong.contact, seen_from), Some(rtt))
                .await;
        }
        Ok(rtt)
    }

    /// Ask `peer` for its contacts closest to `target`.
    async fn query_find_node(&self, peer: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let request = FindNodeRequest {
            sender: self.contact(),
            target,
        };
        let handle = self
            .issue(
                &peer.id,
                &peer.addrs,
                false,
                DHT_FIND_NODE,
                bincode::serialize(&request)?,
                self.inner.config.dht.query_timeout,
            )
            .await?;
        let reply = handle.resolve().await?;
        let response: FindNodeResponse = bincode::deserialize(&reply)?;
        Ok(response.closest)
    }

    /// Iterative lookup for the k nodes closest to `target`.
    ///
    /// Peers that answer are added to the routing table; peers that fail get
    /// a failure recorded against them.
    pub async fn lookup(&self, target: NodeId) -> LookupResult {
        let seeds = self
            .closest_known(&target, self.inner.config.dht.k)
            .await;
        let rpc = Arc::new(NodeRpc { node: self.clone() });
        let params = self.inner.config.dht.lookup_params();

        let result = iterative_find(self.inner.local_id, target, seeds, rpc, &params).await;

        for (contact, rtt) in &result.responded {
            self.observe(contact, Some(*rtt)).await;
        }
        if !result.failed.is_empty() {
            let mut routing = self.inner.routing.write().await;
            for contact in &result.failed {
                routing.record_failure(&contact.id);
            }
        }

        if result.exhausted {
            tracing::warn!(%target, rounds = result.rounds, "Lookup hit round cap");
        } else {
            tracing::debug!(
                %target,
                rounds = result.rounds,
                found = result.closest.len(),
                "Lookup finished"
            );
        }
        result
    }

    /// Locate `peer`'s contact through the network.
    ///
    /// # Errors
    ///
    /// Returns `RoutingExhausted` if the lookup hit its round cap and
    /// `PeerUnreachable` if it converged without finding the peer.
    pub async fn find_node(&self, peer: &NodeId) -> Result<Contact> {
        let result = self.lookup(*peer).await;
        match result.closest.into_iter().find(|contact| contact.id == *peer) {
            Some(contact) => Ok(contact),
            None if result.exhausted => Err(NodeError::RoutingExhausted(*peer)),
            None => Err(NodeError::unreachable("peer not found in the network")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Bootstrap & maintenance
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Join the network through `seeds`.
    ///
    /// Pings every seed directly, then looks up our own ID to fill the
    /// routing table. Unreachable seeds are reported, not fatal.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> BootstrapReport {
        let mut report = BootstrapReport::default();
        let timeout = self.inner.config.dht.query_timeout;

        for &addr in seeds {
            if addr == self.inner.local_addr {
                continue;
            }
            let joined = match self.connect_direct(addr, None).await {
                Ok(channel) => {
                    let seed = NodeId::from_bytes(channel.remote().node_id);
                    self.ping_with_hints(&seed, &[addr], timeout)
                        .await
                        .map(|_| seed)
                }
                Err(e) => Err(e),
            };
            match joined {
                Ok(seed) => {
                    tracing::debug!(%seed, %addr, "Bootstrap seed answered");
                    report.contacted.push(seed);
                }
                Err(e) => {
                    tracing::warn!(seed = %addr, error = %e, "Bootstrap seed unreachable");
                    report.failed.push(addr);
                }
            }
        }

        if report.joined() {
            let lookup = self.lookup(self.inner.local_id).await;
            report.rounds = lookup.rounds;
            report.exhausted = lookup.exhausted;
        }
        report.known_peers = self.routing_len().await;

        tracing::info!(
            contacted = report.contacted.len(),
            failed = report.failed.len(),
            known_peers = report.known_peers,
            "Bootstrap finished"
        );
        report
    }

    /// One maintenance pass: re-bootstrap an empty table from the configured
    /// seeds, refresh stale buckets, prune peers over the failure threshold.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let dht = &self.inner.config.dht;

        let empty = self.inner.routing.read().await.is_empty();
        if empty && !self.inner.config.bootstrap.is_empty() {
            self.bootstrap(&self.inner.config.bootstrap).await;
            report.rebootstrapped = true;
        }

        let stale = self
            .inner
            .routing
            .read()
            .await
            .stale_buckets(dht.refresh_interval);
        for bucket in stale {
            let target = self.inner.routing.read().await.random_id_in_bucket(bucket);
            self.lookup(target).await;
            self.inner.routing.write().await.touch_bucket(bucket);
            report.refreshed += 1;
        }

        report.pruned = self
            .inner
            .routing
            .write()
            .await
            .prune_failed(dht.failure_threshold);
        if !report.pruned.is_empty() {
            tracing::info!(pruned = report.pruned.len(), "Pruned unresponsive peers");
        }
        report
    }

    pub(crate) async fn maintenance_loop(self) {
        let period = self.inner.config.dht.maintenance_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stopped() => break,
                _ = ticker.tick() => {
                    let report = self.run_maintenance().await;
                    tracing::trace!(?report, "Maintenance pass");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::test_util::{fast_config, spawn_node};
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use veil_transport::memory::MemoryNetwork;

    fn advertised_addr() -> impl Strategy<Value = SocketAddr> {
        prop_oneof![
            any::<u16>().prop_map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
            any::<u16>().prop_map(|port| SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)),
            (any::<[u8; 4]>(), any::<u16>())
                .prop_map(|(ip, port)| SocketAddr::new(IpAddr::from(ip), port)),
        ]
    }

    proptest! {
        /// Resolved contacts never carry a wildcard IP, keep the advertised
        /// ports, and list each address once
        #[test]
        fn resolved_contacts_are_dialable(
            addrs in prop::collection::vec(advertised_addr(), 0..8),
            seen in prop::option::of((any::<[u8; 4]>(), any::<u16>())),
        ) {
            let seen = seen
                .map(|(ip, port)| SocketAddr::new(IpAddr::from(ip), port))
                .filter(|addr| !addr.ip().is_unspecified());
            let contact = Contact::new(NodeId::random(), addrs.clone());
            let resolved = resolve_advertised(&contact, seen);

            prop_assert!(resolved.addrs.iter().all(|a| !a.ip().is_unspecified()));
            prop_assert!(resolved.addrs.len() <= addrs.len());
            for addr in &resolved.addrs {
                prop_assert!(addrs.iter().any(|a| a.port() == addr.port()));
                prop_assert_eq!(resolved.addrs.iter().filter(|a| *a == addr).count(), 1);
            }
            if seen.is_some() {
                let mut ports: Vec<u16> = addrs.iter().map(SocketAddr::port).collect();
                ports.sort_unstable();
                ports.dedup();
                let mut got: Vec<u16> = resolved.addrs.iter().map(SocketAddr::port).collect();
                got.sort_unstable();
                got.dedup();
                prop_assert_eq!(got, ports);
            }
        }
    }

    #[tokio::test]
    async fn test_ping_fills_both_tables() {
        let net = MemoryNetwork::default();
        let a = spawn_node(&net, NodeConfig::default()).await;
        let b = spawn_node(&net, NodeConfig::default()).await;

        let rtt = a
            .ping_with_hints(&b.local_id(), &[b.local_addr()], Duration::from_secs(2))
            .await
            .unwrap();
        assert!(rtt < Duration::from_secs(2));

        let snapshot = a.routing_snapshot().await;
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].id, b.local_id());
        assert_eq!(snapshot.entries[0].addrs, vec![b.local_addr()]);

        // b learned a from the ping request.
        assert_eq!(b.routing_len().await, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_discovers_network() {
        let net = MemoryNetwork::default();
        let seed = spawn_node(&net, fast_config()).await;

        let mut members = Vec::new();
        for _ in 0..6 {
            let node = spawn_node(&net, fast_config()).await;
            let report = node.bootstrap(&[seed.local_addr()]).await;
            assert!(report.joined());
            members.push(node);
        }

        let newcomer = spawn_node(&net, fast_config()).await;
        let report = newcomer.bootstrap(&[seed.local_addr()]).await;
        assert_eq!(report.contacted, vec![seed.local_id()]);
        assert!(!report.exhausted);
        // Seed plus every member.
        assert_eq!(report.known_peers, 7);

        let target = members[3].local_id();
        let contact = newcomer.find_node(&target).await.unwrap();
        assert_eq!(contact.addrs, vec![members[3].local_addr()]);
    }

    #[tokio::test]
    async fn test_bootstrap_reports_dead_seed() {
        let net = MemoryNetwork::default();
        let node = spawn_node(&net, fast_config()).await;

        let dead: SocketAddr = "10.255.0.1:9".parse().unwrap();
        let report = node.bootstrap(&[dead, node.local_addr()]).await;
        assert!(!report.joined());
        assert_eq!(report.failed, vec![dead]);
        assert_eq!(report.known_peers, 0);
    }

    #[tokio::test]
    async fn test_find_node_unknown_peer() {
        let net = MemoryNetwork::default();
        let a = spawn_node(&net, fast_config()).await;
        let b = spawn_node(&net, fast_config()).await;
        a.bootstrap(&[b.local_addr()]).await;

        let err = a.find_node(&NodeId::random()).await.unwrap_err();
        assert!(matches!(err, NodeError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_maintenance_prunes_dead_peers() {
        let net = MemoryNetwork::default();
        let mut config = fast_config();
        config.dht.failure_threshold = 2;
        let a = spawn_node(&net, config).await;
        let b = spawn_node(&net, fast_config()).await;

        a.bootstrap(&[b.local_addr()]).await;
        assert_eq!(a.routing_len().await, 1);

        let b_id = b.local_id();
        b.shutdown().await;
        // Let a notice the closed channel.
        for _ in 0..100 {
            if a.route_to(&b_id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for _ in 0..2 {
            assert!(
                a.ping_with_hints(&b_id, &[], Duration::from_millis(200))
                    .await
                    .is_err()
            );
        }

        let report = a.run_maintenance().await;
        assert_eq!(report.pruned, vec![b_id]);
        assert_eq!(a.routing_len().await, 0);
    }

    #[tokio::test]
    async fn test_full_bucket_keeps_live_entry() {
        let net = MemoryNetwork::default();
        let mut config = fast_config();
        config.dht.k = 1;
        let a = spawn_node(&net, config).await;

        // Two peers in the same bucket as seen from a: force it by trying
        // until the second lands next to the first.
        let b = spawn_node(&net, fast_config()).await;
        a.ping_with_hints(&b.local_id(), &[b.local_addr()], Duration::from_secs(2))
            .await
            .unwrap();
        let bucket = b.local_id().bucket_index(&a.local_id());

        let c = loop {
            let c = spawn_node(&net, fast_config()).await;
            if c.local_id().bucket_index(&a.local_id()) == bucket {
                break c;
            }
            c.shutdown().await;
        };
        a.ping_with_hints(&c.local_id(), &[c.local_addr()], Duration::from_secs(2))
            .await
            .unwrap();

        // b answers the probe, so c is not admitted.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = a.routing_snapshot().await;
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].id, b.local_id());
    }

    #[test]
    fn test_resolve_advertised_fills_wildcard_ip() {
        let id = NodeId::random();
        let seen: SocketAddr = "198.51.100.9:51234".parse().unwrap();
        let contact = Contact::new(
            id,
            vec![
                "0.0.0.0:7400".parse().unwrap(),
                "203.0.113.7:7400".parse().unwrap(),
            ],
        );

        let resolved = resolve_advertised(&contact, Some(seen));
        assert_eq!(resolved.id, id);
        assert_eq!(
            resolved.addrs,
            vec![
                "198.51.100.9:7400".parse::<SocketAddr>().unwrap(),
                "203.0.113.7:7400".parse().unwrap(),
            ]
        );

        // Without a link address the wildcard entry is unusable.
        let resolved = resolve_advertised(&contact, None);
        assert_eq!(resolved.addrs, vec!["203.0.113.7:7400".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_advertised_addrs_reach_peers() {
        let net = MemoryNetwork::default();
        let mut config = fast_config();
        let public: SocketAddr = "203.0.113.7:7400".parse().unwrap();
        config.advertised_addrs = vec![public];
        let a = spawn_node(&net, config).await;
        let b = spawn_node(&net, fast_config()).await;
        assert_eq!(a.contact().addrs, vec![public]);

        a.ping_with_hints(&b.local_id(), &[b.local_addr()], Duration::from_secs(2))
            .await
            .unwrap();

        let snapshot = b.routing_snapshot().await;
        let entry = snapshot
            .entries
            .iter()
            .find(|e| e.id == a.local_id())
            .unwrap();
        assert_eq!(entry.addrs, vec![public]);
    }
}
