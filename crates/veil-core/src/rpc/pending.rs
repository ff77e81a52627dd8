//! Pending-call table.
//!
//! One entry per outstanding call, keyed by call ID. Every entry is resolved
//! exactly once: by a matching response, by the sweeper at its deadline, by
//! loss of the channel it was sent on, or silently by cancellation.

use super::envelope::CallId;
use crate::error::NodeError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use veil_discovery::NodeId;

/// Resolution delivered to the waiting caller
pub type CallResult = Result<Vec<u8>, NodeError>;

/// Bookkeeping for one in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    /// Call identifier
    pub call_id: CallId,
    /// Callee
    pub peer: NodeId,
    /// Channel the request went out on
    pub channel_id: [u8; 8],
    /// Method name, for logs
    pub method: String,
    /// Expiry
    pub deadline: Instant,
    /// Attempts beyond the first; the core never retries, so always 0
    pub retries: u32,
    slot: oneshot::Sender<CallResult>,
}

/// Table of outstanding calls.
#[derive(Debug)]
pub struct PendingCalls {
    calls: DashMap<CallId, PendingCall>,
    next_id: AtomicU64,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a call ID
    pub fn next_call_id(&self) -> CallId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a call and return the receiving end of its slot.
    pub fn register(
        &self,
        call_id: CallId,
        peer: NodeId,
        channel_id: [u8; 8],
        method: &str,
        deadline: Instant,
    ) -> oneshot::Receiver<CallResult> {
        let (slot, rx) = oneshot::channel();
        self.calls.insert(
            call_id,
            PendingCall {
                call_id,
                peer,
                channel_id,
                method: method.to_string(),
                deadline,
                retries: 0,
                slot,
            },
        );
        rx
    }

    /// Resolve a call with a response that arrived on `channel_id`.
    ///
    /// Returns `false` (and does nothing) if the ID is unknown, already
    /// resolved, or belongs to a call sent on another channel.
    pub fn complete(&self, call_id: CallId, channel_id: [u8; 8], result: CallResult) -> bool {
        match self
            .calls
            .remove_if(&call_id, |_, call| call.channel_id == channel_id)
        {
            Some((_, call)) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = call.slot.send(result);
                true
            }
            None => false,
        }
    }

    /// Remove a call without resolving it.
    pub fn cancel(&self, call_id: CallId) -> bool {
        self.calls.remove(&call_id).is_some()
    }

    /// Resolve every call past its deadline with a timeout.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<CallId> = self
            .calls
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut swept = 0;
        for call_id in expired {
            if let Some((_, call)) = self.calls.remove_if(&call_id, |_, call| call.deadline <= now)
            {
                tracing::debug!(
                    call_id,
                    peer = %call.peer,
                    method = %call.method,
                    "Call timed out"
                );
                let _ = call.slot.send(Err(NodeError::timeout("call deadline")));
                swept += 1;
            }
        }
        swept
    }

    /// Resolve every call sent on `channel_id` with `ChannelLost`.
    pub fn fail_channel(&self, channel_id: [u8; 8]) -> usize {
        let lost: Vec<CallId> = self
            .calls
            .iter()
            .filter(|entry| entry.channel_id == channel_id)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for call_id in lost {
            if let Some((_, call)) = self.calls.remove(&call_id) {
                let _ = call.slot.send(Err(NodeError::ChannelLost(call.peer)));
                failed += 1;
            }
        }
        failed
    }

    /// Resolve every call with `err`.
    pub fn fail_all(&self, err: &NodeError) -> usize {
        let ids: Vec<CallId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for call_id in ids {
            if let Some((_, call)) = self.calls.remove(&call_id) {
                let _ = call.slot.send(Err(err.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Whether a call is still outstanding
    #[must_use]
    pub fn contains(&self, call_id: CallId) -> bool {
        self.calls.contains_key(&call_id)
    }

    /// Number of outstanding calls
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no calls are outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CHANNEL: [u8; 8] = [1; 8];

    #[tokio::test]
    async fn test_complete_delivers_result() {
        let table = PendingCalls::new();
        let id = table.next_call_id();
        let rx = table.register(
            id,
            NodeId::random(),
            CHANNEL,
            "echo",
            Instant::now() + Duration::from_secs(5),
        );

        assert!(table.complete(id, CHANNEL, Ok(b"pong".to_vec())));
        assert_eq!(rx.await.unwrap().unwrap(), b"pong");
        assert!(table.is_empty());

        // Second response for the same ID is discarded.
        assert!(!table.complete(id, CHANNEL, Ok(Vec::new())));
    }

    #[test]
    fn test_response_on_wrong_channel_ignored() {
        let table = PendingCalls::new();
        let id = table.next_call_id();
        let _rx = table.register(
            id,
            NodeId::random(),
            CHANNEL,
            "echo",
            Instant::now() + Duration::from_secs(5),
        );
        assert!(!table.complete(id, [2; 8], Ok(Vec::new())));
        assert!(table.contains(id));
    }

    #[tokio::test]
    async fn test_sweep_times_out_expired_only() {
        let table = PendingCalls::new();
        let now = Instant::now();
        let expired = table.register(1, NodeId::random(), CHANNEL, "slow", now);
        let live = table.register(2, NodeId::random(), CHANNEL, "fast", now + Duration::from_secs(60));

        assert_eq!(table.sweep(now), 1);
        assert!(matches!(expired.await.unwrap(), Err(NodeError::Timeout(_))));
        assert!(!table.contains(1));
        assert!(table.contains(2));
        drop(live);
    }

    #[tokio::test]
    async fn test_fail_channel_scoped() {
        let table = PendingCalls::new();
        let deadline = Instant::now() + Duration::from_secs(60);
        let peer = NodeId::random();
        let lost = table.register(1, peer, CHANNEL, "a", deadline);
        let _other = table.register(2, NodeId::random(), [9; 8], "b", deadline);

        assert_eq!(table.fail_channel(CHANNEL), 1);
        assert!(matches!(lost.await.unwrap(), Err(NodeError::ChannelLost(p)) if p == peer));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_slot() {
        let table = PendingCalls::new();
        let rx = table.register(
            5,
            NodeId::random(),
            CHANNEL,
            "x",
            Instant::now() + Duration::from_secs(60),
        );
        assert!(table.cancel(5));
        assert!(!table.cancel(5));
        assert!(rx.await.is_err());
        assert!(!table.complete(5, CHANNEL, Ok(Vec::new())));
    }

    #[test]
    fn test_call_ids_unique() {
        let table = PendingCalls::new();
        let a = table.next_call_id();
        let b = table.next_call_id();
        assert_ne!(a, b);
    }
}
