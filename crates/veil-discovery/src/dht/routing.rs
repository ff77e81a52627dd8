//! K-bucket routing table.
//!
//! 256 buckets indexed by the shared prefix length between the local ID and
//! a peer ID. Each bucket holds at most `k` peers ordered from least- to
//! most-recently seen.
//!
//! A full bucket never evicts on its own. [`RoutingTable::insert`] reports
//! [`InsertOutcome::Full`] with the least-recently-seen entry; the caller
//! probes it (without holding whatever lock guards the table) and reports
//! back through [`RoutingTable::resolve_probe`]. A live old peer wins over a
//! new unverified one.

use super::node_id::NodeId;
use super::peer::{Contact, PeerRecord};
use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::time::{Duration, Instant};

/// Bucket capacity
pub const K: usize = 20;

/// Number of buckets (one per bit of the ID)
pub const NUM_BUCKETS: usize = NodeId::BITS;

/// One k-bucket.
#[derive(Debug, Clone)]
pub struct KBucket {
    peers: Vec<PeerRecord>,
    last_touched: Instant,
}

impl KBucket {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            last_touched: Instant::now(),
        }
    }

    /// Entries, least-recently seen first
    #[must_use]
    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the bucket is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Time since the bucket last saw activity or a refresh lookup
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_touched.elapsed()
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|p| p.id == *id)
    }

    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    /// Move an entry to the most-recently-seen end.
    fn promote(&mut self, pos: usize) -> &mut PeerRecord {
        let peer = self.peers.remove(pos);
        self.peers.push(peer);
        let last = self.peers.len() - 1;
        &mut self.peers[last]
    }
}

/// Result of [`RoutingTable::insert`].
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// New peer stored
    Inserted,
    /// Peer was known; addresses merged and marked most recently seen
    Updated,
    /// Bucket is full. Probe `lru` and call
    /// [`RoutingTable::resolve_probe`] with `candidate`.
    Full {
        /// Least-recently-seen entry of the bucket
        lru: PeerRecord,
        /// The peer that could not be inserted
        candidate: PeerRecord,
    },
    /// The local node's own ID
    Rejected,
}

/// Persisted shape of a routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    /// Owner of the table
    pub local_id: NodeId,
    /// Known peers
    pub entries: Vec<Contact>,
}

impl RoutingSnapshot {
    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String, DiscoveryError> {
        serde_json::to_string(self).map_err(|e| DiscoveryError::Serialization(e.to_string()))
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::InvalidSnapshot` on malformed input.
    pub fn from_json(json: &str) -> Result<Self, DiscoveryError> {
        serde_json::from_str(json).map_err(|e| DiscoveryError::InvalidSnapshot(e.to_string()))
    }
}

/// Kademlia routing table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Empty table with the standard bucket size
    #[must_use]
    pub fn new(local_id: NodeId) -> Self {
        Self::with_k(local_id, K)
    }

    /// Empty table with a custom bucket size (at least 1)
    #[must_use]
    pub fn with_k(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k: k.max(1),
            buckets: (0..NUM_BUCKETS).map(|_| KBucket::new()).collect(),
        }
    }

    /// Owner of the table
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket capacity
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Total number of peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// Whether the table holds no peers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    /// All buckets, index = shared prefix length
    #[must_use]
    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// All peers in bucket order
    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.buckets.iter().flat_map(|b| b.peers.iter())
    }

    /// Whether `id` is in the table
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Look up a peer by ID
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        let idx = id.bucket_index(&self.local_id)?;
        self.buckets[idx].peers.iter().find(|p| p.id == *id)
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<(usize, usize)> {
        let idx = id.bucket_index(&self.local_id)?;
        let pos = self.buckets[idx].position(id)?;
        Some((idx, pos))
    }

    /// Place a peer into its bucket.
    pub fn insert(&mut self, peer: PeerRecord) -> InsertOutcome {
        let Some(idx) = peer.id.bucket_index(&self.local_id) else {
            return InsertOutcome::Rejected;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];
        bucket.touch();

        if let Some(pos) = bucket.position(&peer.id) {
            let existing = bucket.promote(pos);
            existing.merge_addrs(&peer.addrs);
            existing.last_seen = existing.last_seen.max(peer.last_seen);
            if peer.rtt.is_some() && existing.rtt.is_none() {
                existing.rtt = peer.rtt;
            }
            return InsertOutcome::Updated;
        }

        if bucket.peers.len() < k {
            tracing::trace!(peer = %peer.id, bucket = idx, "Peer inserted");
            bucket.peers.push(peer);
            return InsertOutcome::Inserted;
        }

        match bucket.peers.first() {
            Some(lru) => InsertOutcome::Full {
                lru: lru.clone(),
                candidate: peer,
            },
            None => InsertOutcome::Rejected,
        }
    }

    /// Apply the result of probing a full bucket's least-recently-seen entry.
    ///
    /// If `lru_alive`, the old entry is refreshed and `candidate` dropped.
    /// Otherwise the old entry is evicted and `candidate` takes its place.
    /// Returns whether `candidate` ended up in the table.
    pub fn resolve_probe(&mut self, lru_id: &NodeId, lru_alive: bool, candidate: PeerRecord) -> bool {
        let Some(idx) = lru_id.bucket_index(&self.local_id) else {
            return false;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        if lru_alive {
            if let Some(pos) = bucket.position(lru_id) {
                bucket.promote(pos).record_success(None);
            }
            tracing::trace!(kept = %lru_id, dropped = %candidate.id, "Bucket full, old peer alive");
            return false;
        }

        if let Some(pos) = bucket.position(lru_id) {
            bucket.peers.remove(pos);
            tracing::debug!(evicted = %lru_id, "Unresponsive peer evicted");
        }

        // The table may have changed while the probe was in flight.
        if candidate.id.bucket_index(&self.local_id) != Some(idx)
            || bucket.position(&candidate.id).is_some()
            || bucket.peers.len() >= k
        {
            return false;
        }
        bucket.peers.push(candidate);
        true
    }

    /// Remove a peer
    pub fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let (idx, pos) = self.get_mut(id)?;
        Some(self.buckets[idx].peers.remove(pos))
    }

    /// Up to `count` peers closest to `target`, nearest first; equal
    /// distances go to the most recently seen.
    #[must_use]
    pub fn lookup(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        if count == 0 {
            return Vec::new();
        }
        let mut peers: Vec<&PeerRecord> = self.peers().collect();
        peers.sort_by_key(|p| (p.id.distance(target), Reverse(p.last_seen)));
        peers.into_iter().take(count).cloned().collect()
    }

    /// Mark a successful interaction. Returns `false` for unknown peers.
    pub fn record_success(&mut self, id: &NodeId, rtt: Option<Duration>) -> bool {
        let Some((idx, pos)) = self.get_mut(id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        bucket.touch();
        bucket.promote(pos).record_success(rtt);
        true
    }

    /// Mark a failed interaction. Returns the new failure count for known peers.
    pub fn record_failure(&mut self, id: &NodeId) -> Option<u32> {
        let (idx, pos) = self.get_mut(id)?;
        Some(self.buckets[idx].peers[pos].record_failure())
    }

    /// Remove every peer whose consecutive failures reached `threshold`.
    pub fn prune_failed(&mut self, threshold: u32) -> Vec<NodeId> {
        let mut pruned = Vec::new();
        for bucket in &mut self.buckets {
            bucket.peers.retain(|p| {
                if p.failures >= threshold {
                    pruned.push(p.id);
                    false
                } else {
                    true
                }
            });
        }
        pruned
    }

    /// Non-empty buckets idle for at least `max_age`.
    #[must_use]
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.idle_for() >= max_age)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Mark a bucket as refreshed
    pub fn touch_bucket(&mut self, idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.touch();
        }
    }

    /// Random ID falling in bucket `idx`, used as a refresh lookup target
    #[must_use]
    pub fn random_id_in_bucket(&self, idx: usize) -> NodeId {
        self.local_id.random_in_bucket(idx)
    }

    /// Persistable view of the table
    #[must_use]
    pub fn snapshot(&self) -> RoutingSnapshot {
        RoutingSnapshot {
            local_id: self.local_id,
            entries: self.peers().map(PeerRecord::contact).collect(),
        }
    }

    /// Load entries from a snapshot. Entries that no longer fit are skipped.
    /// Returns the number of peers inserted.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::InvalidSnapshot` if the snapshot belongs to a
    /// different node.
    pub fn restore(&mut self, snapshot: &RoutingSnapshot) -> Result<usize, DiscoveryError> {
        if snapshot.local_id != self.local_id {
            return Err(DiscoveryError::InvalidSnapshot(format!(
                "snapshot for {} loaded into table of {}",
                snapshot.local_id, self.local_id
            )));
        }
        let mut inserted = 0;
        for contact in &snapshot.entries {
            if matches!(
                self.insert(PeerRecord::from_contact(contact)),
                InsertOutcome::Inserted
            ) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// ID in bucket `bucket` of an all-zero local ID, low bytes from `tag`.
    fn id_in_bucket(bucket: usize, tag: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[bucket / 8] |= 0x80 >> (bucket % 8);
        bytes[31] |= tag;
        NodeId::from_bytes(bytes)
    }

    fn zero_table(k: usize) -> RoutingTable {
        RoutingTable::with_k(NodeId::from_bytes([0u8; 32]), k)
    }

    #[test]
    fn test_insert_and_get() {
        let mut table = zero_table(K);
        let id = id_in_bucket(3, 1);
        assert!(matches!(
            table.insert(PeerRecord::new(id, vec![addr(1)])),
            InsertOutcome::Inserted
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id).unwrap().addrs, vec![addr(1)]);
        assert_eq!(table.buckets()[3].len(), 1);
    }

    #[test]
    fn test_insert_self_rejected() {
        let mut table = zero_table(K);
        let own = *table.local_id();
        assert!(matches!(
            table.insert(PeerRecord::new(own, vec![])),
            InsertOutcome::Rejected
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reinsert_updates_and_promotes() {
        let mut table = zero_table(K);
        let a = id_in_bucket(0, 1);
        let b = id_in_bucket(0, 2);
        table.insert(PeerRecord::new(a, vec![addr(1)]));
        table.insert(PeerRecord::new(b, vec![addr(2)]));

        assert!(matches!(
            table.insert(PeerRecord::new(a, vec![addr(3)])),
            InsertOutcome::Updated
        ));
        let bucket = table.buckets()[0].peers();
        assert_eq!(bucket[0].id, b);
        assert_eq!(bucket[1].id, a);
        assert_eq!(bucket[1].addrs, vec![addr(3), addr(1)]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_full_bucket_reports_lru() {
        let mut table = zero_table(2);
        let a = id_in_bucket(0, 1);
        let b = id_in_bucket(0, 2);
        let c = id_in_bucket(0, 3);
        table.insert(PeerRecord::new(a, vec![]));
        table.insert(PeerRecord::new(b, vec![]));

        match table.insert(PeerRecord::new(c, vec![])) {
            InsertOutcome::Full { lru, candidate } => {
                assert_eq!(lru.id, a);
                assert_eq!(candidate.id, c);
            }
            other => panic!("expected Full, got {other:?}"),
        }
        assert!(!table.contains(&c));
    }

    #[test]
    fn test_probe_alive_keeps_old_peer() {
        let mut table = zero_table(2);
        let (a, b, c) = (id_in_bucket(0, 1), id_in_bucket(0, 2), id_in_bucket(0, 3));
        table.insert(PeerRecord::new(a, vec![]));
        table.insert(PeerRecord::new(b, vec![]));
        let InsertOutcome::Full { lru, candidate } = table.insert(PeerRecord::new(c, vec![]))
        else {
            panic!("bucket should be full");
        };

        assert!(!table.resolve_probe(&lru.id, true, candidate));
        assert!(table.contains(&a));
        assert!(!table.contains(&c));
        // a was refreshed, so b is now least recently seen
        assert_eq!(table.buckets()[0].peers()[0].id, b);
    }

    #[test]
    fn test_probe_dead_replaces_old_peer() {
        let mut table = zero_table(2);
        let (a, b, c) = (id_in_bucket(0, 1), id_in_bucket(0, 2), id_in_bucket(0, 3));
        table.insert(PeerRecord::new(a, vec![]));
        table.insert(PeerRecord::new(b, vec![]));
        let InsertOutcome::Full { lru, candidate } = table.insert(PeerRecord::new(c, vec![]))
        else {
            panic!("bucket should be full");
        };

        assert!(table.resolve_probe(&lru.id, false, candidate));
        assert!(!table.contains(&a));
        assert!(table.contains(&b));
        assert!(table.contains(&c));
        assert_eq!(table.buckets()[0].len(), 2);
    }

    #[test]
    fn test_probe_with_stale_candidate_is_noop() {
        let mut table = zero_table(1);
        let (a, c) = (id_in_bucket(0, 1), id_in_bucket(0, 3));
        table.insert(PeerRecord::new(a, vec![]));
        let InsertOutcome::Full { lru, candidate } = table.insert(PeerRecord::new(c, vec![]))
        else {
            panic!("bucket should be full");
        };
        // c got in some other way while the probe was running
        table.remove(&a);
        table.insert(PeerRecord::new(c, vec![]));

        assert!(!table.resolve_probe(&lru.id, false, candidate));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lookup_orders_by_distance() {
        let mut table = zero_table(K);
        for bucket in [0, 5, 10, 200] {
            table.insert(PeerRecord::new(id_in_bucket(bucket, 0), vec![]));
        }
        let target = id_in_bucket(200, 1);
        let found = table.lookup(&target, 3);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].id, id_in_bucket(200, 0));
        assert_eq!(found[1].id, id_in_bucket(10, 0));
        assert_eq!(found[2].id, id_in_bucket(5, 0));
        assert!(table.lookup(&target, 0).is_empty());
    }

    #[test]
    fn test_record_failure_and_prune() {
        let mut table = zero_table(K);
        let a = id_in_bucket(1, 1);
        let b = id_in_bucket(2, 1);
        table.insert(PeerRecord::new(a, vec![]));
        table.insert(PeerRecord::new(b, vec![]));

        for _ in 0..3 {
            table.record_failure(&a);
        }
        assert_eq!(table.record_failure(&b), Some(1));
        assert!(table.record_success(&b, Some(Duration::from_millis(5))));
        assert_eq!(table.get(&b).unwrap().failures, 0);

        assert_eq!(table.prune_failed(3), vec![a]);
        assert!(!table.contains(&a));
        assert!(table.contains(&b));
        assert_eq!(table.record_failure(&a), None);
    }

    #[test]
    fn test_stale_buckets() {
        let mut table = zero_table(K);
        table.insert(PeerRecord::new(id_in_bucket(4, 0), vec![]));
        assert_eq!(table.stale_buckets(Duration::ZERO), vec![4]);
        assert!(table.stale_buckets(Duration::from_secs(3600)).is_empty());

        let target = table.random_id_in_bucket(4);
        assert_eq!(target.bucket_index(table.local_id()), Some(4));
    }

    #[test]
    fn test_snapshot_roundtrip_through_json() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local);
        for port in 0..30 {
            table.insert(PeerRecord::new(NodeId::random(), vec![addr(port)]));
        }
        let json = table.snapshot().to_json().unwrap();

        let mut restored = RoutingTable::new(local);
        let snapshot = RoutingSnapshot::from_json(&json).unwrap();
        assert_eq!(restored.restore(&snapshot).unwrap(), table.len());
        for peer in table.peers() {
            assert_eq!(restored.get(&peer.id).unwrap().addrs, peer.addrs);
        }
    }

    #[test]
    fn test_restore_rejects_foreign_snapshot() {
        let table = RoutingTable::new(NodeId::random());
        let mut other = RoutingTable::new(NodeId::random());
        assert!(matches!(
            other.restore(&table.snapshot()),
            Err(DiscoveryError::InvalidSnapshot(_))
        ));
        assert!(RoutingSnapshot::from_json("{not json").is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert([u8; 32]),
        Probe(bool),
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => prop::array::uniform32(any::<u8>()).prop_map(Op::Insert),
            // Skewed IDs crowd a few buckets so Full outcomes actually happen.
            3 => (0u8..4, any::<u8>()).prop_map(|(hi, lo)| {
                let mut b = [0u8; 32];
                b[0] = hi << 6;
                b[31] = lo;
                Op::Insert(b)
            }),
            2 => any::<bool>().prop_map(Op::Probe),
            1 => any::<usize>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn buckets_bounded_and_ids_unique(
            k in 1usize..6,
            ops in prop::collection::vec(op_strategy(), 0..300),
        ) {
            let mut table = zero_table(k);
            let mut pending: Option<(NodeId, PeerRecord)> = None;

            for op in ops {
                match op {
                    Op::Insert(bytes) => {
                        if let InsertOutcome::Full { lru, candidate } =
                            table.insert(PeerRecord::new(NodeId::from_bytes(bytes), vec![]))
                        {
                            pending = Some((lru.id, candidate));
                        }
                    }
                    Op::Probe(alive) => {
                        if let Some((lru, candidate)) = pending.take() {
                            table.resolve_probe(&lru, alive, candidate);
                        }
                    }
                    Op::Remove(n) => {
                        let ids: Vec<_> = table.peers().map(|p| p.id).collect();
                        if !ids.is_empty() {
                            table.remove(&ids[n % ids.len()]);
                        }
                    }
                }

                for bucket in table.buckets() {
                    prop_assert!(bucket.len() <= k);
                }
                let mut seen = HashSet::new();
                for (idx, bucket) in table.buckets().iter().enumerate() {
                    for peer in bucket.peers() {
                        prop_assert!(seen.insert(peer.id));
                        prop_assert_eq!(peer.id.bucket_index(table.local_id()), Some(idx));
                    }
                }
                prop_assert!(!table.contains(table.local_id()));
            }
        }
    }
}
