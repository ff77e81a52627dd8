//! Relay selection.
//!
//! Candidates are nodes the caller holds a direct channel to. Live channels
//! rank before stale ones, then lower measured latency wins; candidates
//! without a latency sample go last.

use crate::dht::NodeId;
use std::collections::HashMap;
use std::time::Duration;

/// A node that could forward traffic for us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCandidate {
    /// Relay node ID
    pub id: NodeId,
    /// Measured round-trip time to the relay
    pub latency: Option<Duration>,
    /// Whether our direct channel to it is currently open
    pub live: bool,
}

impl RelayCandidate {
    /// A live candidate with no latency sample
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            latency: None,
            live: true,
        }
    }

    /// Set measured latency
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Set liveness
    #[must_use]
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    fn rank(&self) -> (bool, bool, Duration, NodeId) {
        (
            !self.live,
            self.latency.is_none(),
            self.latency.unwrap_or(Duration::MAX),
            self.id,
        )
    }
}

/// Ranks relay candidates
#[derive(Debug, Clone, Default)]
pub struct RelaySelector {
    candidates: HashMap<NodeId, RelayCandidate>,
}

impl RelaySelector {
    /// Create an empty selector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a candidate
    pub fn add_candidate(&mut self, candidate: RelayCandidate) {
        self.candidates.insert(candidate.id, candidate);
    }

    /// Remove a candidate
    pub fn remove_candidate(&mut self, id: &NodeId) -> Option<RelayCandidate> {
        self.candidates.remove(id)
    }

    /// Update a candidate's latency sample
    pub fn record_latency(&mut self, id: &NodeId, latency: Duration) {
        if let Some(candidate) = self.candidates.get_mut(id) {
            candidate.latency = Some(latency);
        }
    }

    /// Number of candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether there are no candidates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Best candidate not in `exclude`
    #[must_use]
    pub fn select_best(&self, exclude: &[NodeId]) -> Option<&RelayCandidate> {
        self.candidates
            .values()
            .filter(|c| !exclude.contains(&c.id))
            .min_by_key(|c| c.rank())
    }

    /// Up to `count` candidates not in `exclude`, best first
    #[must_use]
    pub fn ranked(&self, count: usize, exclude: &[NodeId]) -> Vec<&RelayCandidate> {
        let mut candidates: Vec<&RelayCandidate> = self
            .candidates
            .values()
            .filter(|c| !exclude.contains(&c.id))
            .collect();
        candidates.sort_by_key(|c| c.rank());
        candidates.truncate(count);
        candidates
    }
}
