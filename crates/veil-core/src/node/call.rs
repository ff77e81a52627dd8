//! Outbound calls and method registration.

use crate::error::{CallError, NodeError, Result};
use crate::node::Node;
use crate::rpc::{CallId, CallResult, Envelope, PendingCalls, RpcHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use veil_discovery::NodeId;

/// Prefix reserved for built-in methods
const RESERVED_PREFIX: &str = "dht.";

/// An issued call awaiting its response.
///
/// Dropping the handle cancels the call: its pending entry is removed and a
/// late response is discarded.
#[derive(Debug)]
pub struct CallHandle {
    call_id: CallId,
    peer: NodeId,
    rx: oneshot::Receiver<CallResult>,
    pending: Arc<PendingCalls>,
}

impl CallHandle {
    /// Call identifier
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Callee
    #[must_use]
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Wait for the response, the deadline or the loss of the channel.
    ///
    /// # Errors
    ///
    /// One of the three [`CallError`] outcomes.
    pub async fn wait(self) -> std::result::Result<Vec<u8>, CallError> {
        self.resolve().await.map_err(CallError::from)
    }

    /// Stop waiting. A response that arrives later is discarded.
    pub fn cancel(self) {
        tracing::debug!(call_id = self.call_id, peer = %self.peer, "Call cancelled");
    }

    pub(crate) async fn resolve(mut self) -> CallResult {
        match (&mut self.rx).await {
            Ok(result) => result,
            // The slot went away without a result: the node was torn down.
            Err(_) => Err(NodeError::Cancelled),
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.pending.cancel(self.call_id);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Calls
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Call `method` on `peer` and wait for the outcome.
    ///
    /// Opens a channel if needed (direct first, then through a relay). The
    /// `timeout` covers channel establishment as well as the response; the
    /// call resolves within one sweep interval of it.
    ///
    /// # Errors
    ///
    /// - `CallError::Application` when the remote handler fails or the
    ///   method is unknown
    /// - `CallError::Timeout` when no response arrived in time
    /// - `CallError::Unreachable` when no route exists or the channel was lost
    pub async fn call(
        &self,
        peer: &NodeId,
        method: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, CallError> {
        self.start_call(peer, method, payload, timeout).await?.wait().await
    }

    /// Like [`Node::call`] with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`Node::call`].
    pub async fn call_default(
        &self,
        peer: &NodeId,
        method: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, CallError> {
        self.call(peer, method, payload, self.inner.config.rpc.default_timeout)
            .await
    }

    /// Send a request and return a handle to wait on or cancel.
    ///
    /// # Errors
    ///
    /// Fails with `Timeout` or `Unreachable` if the request could not be
    /// sent.
    pub async fn start_call(
        &self,
        peer: &NodeId,
        method: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<CallHandle, CallError> {
        Ok(self.issue(peer, &[], true, method, payload, timeout).await?)
    }

    /// Open or reuse a channel, register the call and send the request.
    pub(crate) async fn issue(
        &self,
        peer: &NodeId,
        hints: &[SocketAddr],
        locate: bool,
        method: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<CallHandle> {
        self.ensure_running()?;
        let deadline = Instant::now() + timeout;
        let until = tokio::time::Instant::from_std(deadline);

        let channel = match tokio::time::timeout_at(until, self.channel_to(peer, hints, locate)).await
        {
            Ok(channel) => channel?,
            Err(_) => return Err(NodeError::timeout("channel establishment")),
        };

        let stream = channel
            .open_stream()
            .map_err(|e| NodeError::from_channel(*peer, e))?;
        let call_id = self.inner.pending.next_call_id();
        let request = Envelope::request(call_id, method, payload).encode()?;

        // Registered before sending so a fast response finds its entry.
        let rx = self
            .inner
            .pending
            .register(call_id, *peer, channel.channel_id(), method, deadline);
        let handle = CallHandle {
            call_id,
            peer: *peer,
            rx,
            pending: Arc::clone(&self.inner.pending),
        };

        match tokio::time::timeout_at(until, channel.send(stream, request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(NodeError::from_channel(*peer, e)),
            Err(_) => return Err(NodeError::timeout("request send")),
        }

        tracing::trace!(call_id, %peer, method, "Call issued");
        Ok(handle)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Serving
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Register `handler` for `method`, replacing any previous handler.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` for empty names and names in the
    /// reserved `dht.` namespace.
    pub fn serve<H: RpcHandler>(&self, method: &str, handler: H) -> Result<()> {
        if method.is_empty() {
            return Err(NodeError::invalid_config("method name must not be empty"));
        }
        if method.starts_with(RESERVED_PREFIX) {
            return Err(NodeError::invalid_config("dht.* methods are reserved"));
        }
        self.inner
            .handlers
            .insert(method.to_string(), Arc::new(handler));
        tracing::debug!(method, "Method registered");
        Ok(())
    }

    /// Remove the handler for `method`. Returns false if none was registered.
    pub fn unserve(&self, method: &str) -> bool {
        self.inner.handlers.remove(method).is_some()
    }
}
