//! Peer records.

use super::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Upper bound on addresses kept per peer
pub const MAX_ADDRS_PER_PEER: usize = 8;

/// What one node tells another about a peer: its ID and where to reach it.
///
/// This is the wire and snapshot shape; [`PeerRecord`] adds local
/// bookkeeping on top.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// Peer node ID
    pub id: NodeId,
    /// Known socket addresses, most preferred first
    pub addrs: Vec<SocketAddr>,
}

impl Contact {
    /// Create a contact
    #[must_use]
    pub fn new(id: NodeId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }
}

/// Routing table entry.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer node ID
    pub id: NodeId,
    /// Known socket addresses, most recently confirmed first
    pub addrs: Vec<SocketAddr>,
    /// Last successful interaction
    pub last_seen: Instant,
    /// Smoothed round-trip time, once measured
    pub rtt: Option<Duration>,
    /// Consecutive failed interactions
    pub failures: u32,
}

impl PeerRecord {
    /// Record for a peer first contacted now
    #[must_use]
    pub fn new(id: NodeId, addrs: Vec<SocketAddr>) -> Self {
        let mut record = Self {
            id,
            addrs: Vec::new(),
            last_seen: Instant::now(),
            rtt: None,
            failures: 0,
        };
        record.merge_addrs(&addrs);
        record
    }

    /// Record built from a contact
    #[must_use]
    pub fn from_contact(contact: &Contact) -> Self {
        Self::new(contact.id, contact.addrs.clone())
    }

    /// Wire view of this record
    #[must_use]
    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.addrs.clone())
    }

    /// Add addresses not yet known, keeping the newest ones first.
    pub fn merge_addrs(&mut self, addrs: &[SocketAddr]) {
        for addr in addrs.iter().rev() {
            if let Some(pos) = self.addrs.iter().position(|a| a == addr) {
                self.addrs.remove(pos);
            }
            self.addrs.insert(0, *addr);
        }
        self.addrs.truncate(MAX_ADDRS_PER_PEER);
    }

    /// A successful interaction: refresh, clear failures, fold in the RTT
    /// sample (1/8 weight, as TCP smooths its RTT estimate).
    pub fn record_success(&mut self, rtt: Option<Duration>) {
        self.last_seen = Instant::now();
        self.failures = 0;
        if let Some(sample) = rtt {
            self.rtt = Some(match self.rtt {
                Some(current) => (current * 7 + sample) / 8,
                None => sample,
            });
        }
    }

    /// A failed interaction. Returns the new consecutive failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    /// Time since the last successful interaction
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_merge_addrs_dedups_and_prefers_new() {
        let mut peer = PeerRecord::new(NodeId::random(), vec![addr(1), addr(2)]);
        peer.merge_addrs(&[addr(3), addr(1)]);
        assert_eq!(peer.addrs, vec![addr(3), addr(1), addr(2)]);
    }

    #[test]
    fn test_merge_addrs_bounded() {
        let mut peer = PeerRecord::new(NodeId::random(), Vec::new());
        let many: Vec<_> = (0..20).map(addr).collect();
        peer.merge_addrs(&many);
        assert_eq!(peer.addrs.len(), MAX_ADDRS_PER_PEER);
        assert_eq!(peer.addrs[0], addr(0));
    }

    #[test]
    fn test_success_resets_failures_and_smooths_rtt() {
        let mut peer = PeerRecord::new(NodeId::random(), vec![addr(1)]);
        assert_eq!(peer.record_failure(), 1);
        assert_eq!(peer.record_failure(), 2);

        peer.record_success(Some(Duration::from_millis(80)));
        assert_eq!(peer.failures, 0);
        assert_eq!(peer.rtt, Some(Duration::from_millis(80)));

        peer.record_success(Some(Duration::from_millis(160)));
        assert_eq!(peer.rtt, Some(Duration::from_millis(90)));

        peer.record_success(None);
        assert_eq!(peer.rtt, Some(Duration::from_millis(90)));
    }

    #[test]
    fn test_contact_roundtrip() {
        let contact = Contact::new(NodeId::random(), vec![addr(9)]);
        let record = PeerRecord::from_contact(&contact);
        assert_eq!(record.contact(), contact);
    }
}
