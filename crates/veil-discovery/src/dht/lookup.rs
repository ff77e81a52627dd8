//! Iterative node lookup.
//!
//! Each round queries the closest peers not yet asked, merges what they
//! return and repeats. While rounds keep finding closer peers only α queries
//! run at a time; after a round that finds nothing closer, every unqueried
//! peer among the k closest is asked at once. The lookup converges when all
//! of the k closest known peers have been queried.

use super::node_id::NodeId;
use super::peer::Contact;
use super::routing::K;
use super::{ALPHA, DEFAULT_QUERY_TIMEOUT, MAX_ROUNDS};
use crate::error::DiscoveryError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Remote FIND_NODE capability used by [`iterative_find`].
#[async_trait]
pub trait FindNodeRpc: Send + Sync {
    /// Ask `peer` for the contacts it knows closest to `target`.
    async fn find_node(&self, peer: &Contact, target: NodeId)
    -> Result<Vec<Contact>, DiscoveryError>;
}

/// Lookup tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupParams {
    /// Result set size
    pub k: usize,
    /// Queries per round while making progress
    pub alpha: usize,
    /// Round cap
    pub max_rounds: usize,
    /// Per-query timeout
    pub query_timeout: Duration,
}

impl Default for LookupParams {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            max_rounds: MAX_ROUNDS,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Outcome of an iterative lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupResult {
    /// Up to k closest live peers, nearest first
    pub closest: Vec<Contact>,
    /// Rounds executed
    pub rounds: usize,
    /// The round cap was hit before convergence; `closest` is best effort
    pub exhausted: bool,
    /// Peers that answered, with the measured query time
    pub responded: Vec<(Contact, Duration)>,
    /// Peers that failed or timed out
    pub failed: Vec<Contact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    contact: Contact,
    state: QueryState,
}

/// Shortlist keyed by distance to the target, so iteration is nearest first.
struct Shortlist {
    local_id: NodeId,
    target: NodeId,
    entries: BTreeMap<NodeId, Candidate>,
}

impl Shortlist {
    fn new(local_id: NodeId, target: NodeId) -> Self {
        Self {
            local_id,
            target,
            entries: BTreeMap::new(),
        }
    }

    fn admit(&mut self, contact: Contact) {
        if contact.id == self.local_id {
            return;
        }
        match self.entries.entry(contact.id.distance(&self.target)) {
            Entry::Vacant(slot) => {
                slot.insert(Candidate {
                    contact,
                    state: QueryState::Unqueried,
                });
            }
            Entry::Occupied(mut slot) => {
                let known = &mut slot.get_mut().contact;
                for addr in contact.addrs {
                    if !known.addrs.contains(&addr) {
                        known.addrs.push(addr);
                    }
                }
            }
        }
    }

    fn live(&self) -> impl Iterator<Item = &Candidate> {
        self.entries
            .values()
            .filter(|c| c.state != QueryState::Failed)
    }

    fn best_distance(&self) -> Option<NodeId> {
        self.entries
            .iter()
            .find(|(_, c)| c.state != QueryState::Failed)
            .map(|(d, _)| *d)
    }

    /// Unqueried peers among the `k` closest live ones.
    fn pending(&self, k: usize) -> Vec<Contact> {
        self.live()
            .take(k)
            .filter(|c| c.state == QueryState::Unqueried)
            .map(|c| c.contact.clone())
            .collect()
    }

    fn set_state(&mut self, id: &NodeId, state: QueryState) {
        if let Some(candidate) = self.entries.get_mut(&id.distance(&self.target)) {
            candidate.state = state;
        }
    }
}

/// Run an iterative lookup for `target` starting from `seeds`.
///
/// The local node is never queried or returned. Failed peers are reported
/// in [`LookupResult::failed`] and excluded from the result.
pub async fn iterative_find<R>(
    local_id: NodeId,
    target: NodeId,
    seeds: impl IntoIterator<Item = Contact>,
    rpc: Arc<R>,
    params: &LookupParams,
) -> LookupResult
where
    R: FindNodeRpc + ?Sized + 'static,
{
    let k = params.k.max(1);
    let alpha = params.alpha.max(1);

    let mut shortlist = Shortlist::new(local_id, target);
    for seed in seeds {
        shortlist.admit(seed);
    }

    let mut result = LookupResult::default();
    let mut progressing = true;

    loop {
        let mut batch = shortlist.pending(k);
        if batch.is_empty() {
            break;
        }
        if result.rounds >= params.max_rounds {
            result.exhausted = true;
            tracing::debug!(%target, rounds = result.rounds, "Lookup hit round cap");
            break;
        }
        if progressing {
            batch.truncate(alpha);
        }
        result.rounds += 1;
        let best_before = shortlist.best_distance();

        let mut queries = JoinSet::new();
        for contact in batch {
            shortlist.set_state(&contact.id, QueryState::InFlight);
            let rpc = Arc::clone(&rpc);
            let timeout = params.query_timeout;
            queries.spawn(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, rpc.find_node(&contact, target))
                    .await
                    .unwrap_or(Err(DiscoveryError::Timeout));
                (contact, started.elapsed(), outcome)
            });
        }

        while let Some(joined) = queries.join_next().await {
            let (contact, elapsed, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(error = %e, "Lookup query task failed");
                    continue;
                }
            };
            match outcome {
                Ok(contacts) => {
                    shortlist.set_state(&contact.id, QueryState::Responded);
                    for found in contacts {
                        shortlist.admit(found);
                    }
                    result.responded.push((contact, elapsed));
                }
                Err(e) => {
                    tracing::debug!(peer = %contact.id, error = %e, "Lookup query failed");
                    shortlist.set_state(&contact.id, QueryState::Failed);
                    result.failed.push(contact);
                }
            }
        }

        progressing = match (shortlist.best_distance(), best_before) {
            (Some(after), Some(before)) => after < before,
            (Some(_), None) => true,
            (None, _) => false,
        };
    }

    result.closest = shortlist.live().take(k).map(|c| c.contact.clone()).collect();
    tracing::debug!(
        %target,
        rounds = result.rounds,
        found = result.closest.len(),
        failed = result.failed.len(),
        "Lookup finished"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{PeerRecord, RoutingTable};
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::collections::{HashMap, HashSet};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process network where every node answers from its own routing table.
    struct SimNetwork {
        tables: HashMap<NodeId, RoutingTable>,
        dead: HashSet<NodeId>,
        slow: HashSet<NodeId>,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl FindNodeRpc for SimNetwork {
        async fn find_node(
            &self,
            peer: &Contact,
            target: NodeId,
        ) -> Result<Vec<Contact>, DiscoveryError> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            if self.slow.contains(&peer.id) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.dead.contains(&peer.id) {
                return Err(DiscoveryError::RpcFailed("unreachable".into()));
            }
            let table = self
                .tables
                .get(&peer.id)
                .ok_or_else(|| DiscoveryError::RpcFailed("unknown peer".into()))?;
            Ok(table
                .lookup(&target, K)
                .iter()
                .map(PeerRecord::contact)
                .collect())
        }
    }

    fn contact(id: NodeId) -> Contact {
        Contact::new(id, vec![SocketAddr::from(([10, 0, 0, 1], 4000))])
    }

    fn random_id(rng: &mut StdRng) -> NodeId {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        NodeId::from_bytes(bytes)
    }

    fn build_network(size: usize, seed: u64) -> (Vec<NodeId>, SimNetwork) {
        let mut rng = StdRng::seed_from_u64(seed);
        let ids: Vec<NodeId> = (0..size).map(|_| random_id(&mut rng)).collect();
        let tables = ids
            .iter()
            .map(|id| {
                let mut table = RoutingTable::new(*id);
                for other in &ids {
                    table.insert(PeerRecord::from_contact(&contact(*other)));
                }
                (*id, table)
            })
            .collect();
        (
            ids,
            SimNetwork {
                tables,
                dead: HashSet::new(),
                slow: HashSet::new(),
                queries: AtomicUsize::new(0),
            },
        )
    }

    fn true_closest(ids: &[NodeId], exclude: &HashSet<NodeId>, target: &NodeId) -> Vec<NodeId> {
        let mut sorted: Vec<NodeId> = ids.iter().filter(|id| !exclude.contains(id)).copied().collect();
        sorted.sort_by_key(|id| id.distance(target));
        sorted.truncate(K);
        sorted
    }

    fn seeds_for(net: &SimNetwork, local: &NodeId, target: &NodeId) -> Vec<Contact> {
        net.tables[local]
            .lookup(target, ALPHA)
            .iter()
            .map(PeerRecord::contact)
            .collect()
    }

    #[tokio::test]
    async fn test_converges_to_true_closest() {
        let (ids, net) = build_network(256, 7);
        let net = Arc::new(net);
        let local = ids[0];
        let mut rng = StdRng::seed_from_u64(99);

        for _ in 0..3 {
            let target = random_id(&mut rng);
            let seeds = seeds_for(&net, &local, &target);
            let result =
                iterative_find(local, target, seeds, Arc::clone(&net), &LookupParams::default())
                    .await;

            let found: Vec<NodeId> = result.closest.iter().map(|c| c.id).collect();
            let exclude = HashSet::from([local]);
            assert_eq!(found, true_closest(&ids, &exclude, &target));
            assert!(!result.exhausted);
            assert!(result.failed.is_empty());
            // log2(256) plus slack for the final widening rounds
            assert!(result.rounds <= 10, "took {} rounds", result.rounds);
        }
    }

    #[tokio::test]
    async fn test_never_returns_local_node() {
        let (ids, net) = build_network(64, 3);
        let net = Arc::new(net);
        let local = ids[5];

        let seeds = seeds_for(&net, &local, &local);
        let result =
            iterative_find(local, local, seeds, Arc::clone(&net), &LookupParams::default()).await;

        assert!(result.closest.iter().all(|c| c.id != local));
        assert!(result.responded.iter().all(|(c, _)| c.id != local));
        assert_eq!(result.closest.len(), K);
    }

    #[tokio::test]
    async fn test_dead_peers_reported_and_excluded() {
        let (ids, mut net) = build_network(128, 11);
        let local = ids[0];
        net.dead = ids[1..].iter().step_by(4).copied().collect();
        let dead = net.dead.clone();
        let net = Arc::new(net);

        let target = ids[64];
        let seeds: Vec<Contact> = ids[1..8].iter().map(|id| contact(*id)).collect();
        let result =
            iterative_find(local, target, seeds, Arc::clone(&net), &LookupParams::default()).await;

        assert!(!result.failed.is_empty());
        assert!(result.failed.iter().all(|c| dead.contains(&c.id)));
        assert!(result.closest.iter().all(|c| !dead.contains(&c.id)));
        assert_eq!(result.closest.len(), K);
    }

    #[tokio::test]
    async fn test_round_cap_marks_exhausted() {
        let (ids, net) = build_network(256, 21);
        let net = Arc::new(net);
        let local = ids[0];
        let target = ids[200];
        let seeds: Vec<Contact> = ids[1..4].iter().map(|id| contact(*id)).collect();

        let params = LookupParams {
            max_rounds: 1,
            ..LookupParams::default()
        };
        let result = iterative_find(local, target, seeds, Arc::clone(&net), &params).await;

        assert_eq!(result.rounds, 1);
        assert!(result.exhausted);
        assert_eq!(net.queries.load(Ordering::Relaxed), ALPHA);
        assert!(!result.closest.is_empty());
    }

    #[tokio::test]
    async fn test_slow_peer_times_out() {
        let (ids, mut net) = build_network(32, 5);
        let local = ids[0];
        net.slow.insert(ids[1]);
        let net = Arc::new(net);

        let params = LookupParams {
            query_timeout: Duration::from_millis(100),
            ..LookupParams::default()
        };
        let started = Instant::now();
        let result = iterative_find(
            local,
            ids[2],
            vec![contact(ids[1]), contact(ids[3])],
            Arc::clone(&net),
            &params,
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.failed.iter().any(|c| c.id == ids[1]));
        assert!(result.closest.iter().any(|c| c.id == ids[2]));
    }

    #[tokio::test]
    async fn test_no_seeds() {
        let (ids, net) = build_network(8, 1);
        let net = Arc::new(net);
        let result = iterative_find(
            ids[0],
            NodeId::random(),
            vec![contact(ids[0])],
            Arc::clone(&net),
            &LookupParams::default(),
        )
        .await;

        assert!(result.closest.is_empty());
        assert_eq!(result.rounds, 0);
        assert!(!result.exhausted);
        assert_eq!(net.queries.load(Ordering::Relaxed), 0);
    }
}
