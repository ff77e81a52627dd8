//! Channel registry, dialing and per-channel dispatch.
//!
//! At most one channel per peer is registered. When two channels to the same
//! peer come up (simultaneous dials, or a direct link after a relayed one),
//! the registered open channel wins unless the newcomer is direct and the
//! incumbent relayed. A superseded channel keeps serving whatever is already
//! in flight on it and closes once idle.

use crate::error::{NodeError, Result};
use crate::node::Node;
use crate::node::node::CLOSE_TIMEOUT;
use crate::rpc::{Direction, ENVELOPE_VERSION, Envelope, Request, Status};
use dashmap::mapref::entry::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use veil_discovery::NodeId;
use veil_transport::channel::CONTROL_STREAM;
use veil_transport::{
    ChannelState, Role, SecureChannel, StreamId, TransportError, perform_handshake,
};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How a channel reaches its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Over a transport link to the peer itself
    Direct,
    /// Over a tunnel through another node
    Relayed {
        /// The forwarding node
        via: NodeId,
    },
}

/// Registry entry
#[derive(Debug, Clone)]
pub(crate) struct ChannelEntry {
    pub(crate) channel: Arc<SecureChannel>,
    pub(crate) route: Route,
    pub(crate) established: Instant,
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Registered open channel to `peer`, if any.
    pub(crate) fn open_channel(&self, peer: &NodeId) -> Option<Arc<SecureChannel>> {
        self.inner
            .channels
            .get(peer)
            .filter(|entry| entry.channel.is_open())
            .map(|entry| Arc::clone(&entry.channel))
    }

    /// Registered open channel to `peer` over a direct link, if any.
    pub(crate) fn direct_channel(&self, peer: &NodeId) -> Option<Arc<SecureChannel>> {
        self.inner
            .channels
            .get(peer)
            .filter(|entry| entry.route == Route::Direct && entry.channel.is_open())
            .map(|entry| Arc::clone(&entry.channel))
    }

    /// Peers with an open channel
    #[must_use]
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner
            .channels
            .iter()
            .filter(|entry| entry.channel.is_open())
            .map(|entry| *entry.key())
            .collect()
    }

    /// How the channel to `peer` is routed, if one is open
    #[must_use]
    pub fn route_to(&self, peer: &NodeId) -> Option<Route> {
        self.inner
            .channels
            .get(peer)
            .filter(|entry| entry.channel.is_open())
            .map(|entry| entry.route)
    }

    /// How long the channel to `peer` has been registered
    #[must_use]
    pub fn channel_age(&self, peer: &NodeId) -> Option<Duration> {
        self.inner
            .channels
            .get(peer)
            .map(|entry| entry.established.elapsed())
    }

    /// Close the channel to `peer`.
    ///
    /// Calls in flight on it fail with `ChannelLost`. Returns false if no
    /// channel was registered.
    pub async fn disconnect(&self, peer: &NodeId) -> bool {
        let Some((_, entry)) = self.inner.channels.remove(peer) else {
            return false;
        };
        tracing::debug!(%peer, "Disconnecting");
        entry.channel.close().await;
        true
    }

    /// Register a freshly handshaken channel and start dispatching on it.
    pub(crate) fn install_channel(&self, channel: SecureChannel, route: Route) -> Arc<SecureChannel> {
        let channel = Arc::new(channel);
        let peer = NodeId::from_bytes(channel.remote().node_id);
        let entry = ChannelEntry {
            channel: Arc::clone(&channel),
            route,
            established: Instant::now(),
        };

        let registered = match self.inner.channels.entry(peer) {
            Entry::Occupied(mut occupied) => {
                let incumbent = occupied.get();
                let replace = !incumbent.channel.is_open()
                    || (route == Route::Direct && incumbent.route != Route::Direct);
                if replace {
                    occupied.insert(entry);
                }
                replace
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        };

        tracing::info!(
            %peer,
            channel = %hex::encode(channel.channel_id()),
            ?route,
            registered,
            "Channel established"
        );

        tokio::spawn(self.clone().dispatch(peer, Arc::clone(&channel)));
        channel
    }

    /// Drop registry state for a channel that stopped.
    async fn channel_ended(&self, peer: NodeId, channel: &SecureChannel) {
        let channel_id = channel.channel_id();
        let was_registered = self
            .inner
            .channels
            .remove_if(&peer, |_, entry| entry.channel.channel_id() == channel_id)
            .is_some();

        let failed_calls = self.inner.pending.fail_channel(channel_id);

        let state = channel.state();
        if state == ChannelState::Corrupted {
            self.inner.routing.write().await.record_failure(&peer);
        }

        if self.open_channel(&peer).is_none() {
            self.drop_tunnels_of(peer).await;
        }

        tracing::info!(
            %peer,
            channel = %hex::encode(channel_id),
            ?state,
            was_registered,
            failed_calls,
            "Channel ended"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dialing
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Existing channel to `peer`, or a new one.
    ///
    /// Tries `hints` and the routing table's addresses directly, then relays.
    /// With `locate` set and no address known, runs a lookup for the peer
    /// first.
    pub(crate) async fn channel_to(
        &self,
        peer: &NodeId,
        hints: &[SocketAddr],
        locate: bool,
    ) -> Result<Arc<SecureChannel>> {
        if *peer == self.inner.local_id {
            return Err(NodeError::unreachable("cannot open a channel to self"));
        }
        if let Some(channel) = self.open_channel(peer) {
            return Ok(channel);
        }

        let mut addrs = hints.to_vec();
        let known = {
            let routing = self.inner.routing.read().await;
            routing.get(peer).map(|record| record.addrs.clone())
        };
        for addr in known.into_iter().flatten() {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }

        if addrs.is_empty() && locate {
            let result = self.lookup(*peer).await;
            // The lookup may have reached the peer itself, possibly via a relay.
            if let Some(channel) = self.open_channel(peer) {
                return Ok(channel);
            }
            match result.closest.iter().find(|contact| contact.id == *peer) {
                Some(contact) => addrs.clone_from(&contact.addrs),
                None if result.exhausted => return Err(NodeError::RoutingExhausted(*peer)),
                None => return Err(NodeError::unreachable("peer not found in the network")),
            }
        }

        let mut last_err = None;
        for addr in addrs {
            match self.connect_direct(addr, Some(peer)).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    tracing::debug!(%peer, %addr, error = %e, "Direct connect failed");
                    last_err = Some(e);
                }
            }
        }

        if self.inner.config.relay.enabled {
            match self.connect_relayed(peer).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "Relay fallback failed");
                    last_err = Some(e);
                }
            }
        }

        self.inner.routing.write().await.record_failure(peer);
        Err(last_err.unwrap_or(NodeError::unreachable("no route to peer")))
    }

    /// Dial `addr` and run the initiator handshake.
    ///
    /// With `expected` set, the authenticated remote must carry that ID.
    pub(crate) async fn connect_direct(
        &self,
        addr: SocketAddr,
        expected: Option<&NodeId>,
    ) -> Result<Arc<SecureChannel>> {
        self.ensure_running()?;
        let connect = self.inner.transport.connect(addr);
        let link = match tokio::time::timeout(self.inner.config.connect_timeout, connect).await {
            Ok(link) => link?,
            Err(_) => return Err(NodeError::timeout("connect")),
        };

        let channel = perform_handshake(
            &self.inner.identity,
            link,
            Role::Initiator,
            &self.inner.config.channel,
        )
        .await?;

        let remote = NodeId::from_bytes(channel.remote().node_id);
        if remote == self.inner.local_id {
            channel.close().await;
            return Err(NodeError::handshake("dialed our own address"));
        }
        if expected.is_some_and(|id| *id != remote) {
            tracing::warn!(%addr, %remote, "Peer at address has a different identity");
            channel.close().await;
            return Err(NodeError::handshake("peer identity mismatch"));
        }

        Ok(self.install_channel(channel, Route::Direct))
    }

    /// Accept inbound links until shutdown.
    pub(crate) async fn accept_loop(self) {
        loop {
            let link = tokio::select! {
                () = self.stopped() => break,
                accepted = self.inner.transport.accept() => match accepted {
                    Ok(link) => link,
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let node = self.clone();
            tokio::spawn(async move {
                let peer_addr = link.peer_addr();
                match perform_handshake(
                    &node.inner.identity,
                    link,
                    Role::Responder,
                    &node.inner.config.channel,
                )
                .await
                {
                    Ok(channel) => {
                        node.install_channel(channel, Route::Direct);
                    }
                    Err(e) => {
                        tracing::debug!(peer_addr = ?peer_addr, error = %e, "Inbound handshake failed");
                    }
                }
            });
        }
        tracing::debug!("Accept loop stopped");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Route every inbound message of one channel until it ends.
    async fn dispatch(self, peer: NodeId, channel: Arc<SecureChannel>) {
        let channel_id = channel.channel_id();

        loop {
            let received = tokio::select! {
                () = self.stopped() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await;
                    break;
                }
                received = channel.receive() => received,
            };

            let (stream, bytes) = match received {
                Ok(message) => message,
                Err(e) if e.is_corruption() => {
                    tracing::warn!(%peer, "Channel corrupted");
                    break;
                }
                Err(e) => {
                    tracing::debug!(%peer, reason = %e, "Channel receive ended");
                    break;
                }
            };

            if stream == CONTROL_STREAM {
                self.handle_relay_message(peer, &channel, &bytes).await;
                continue;
            }

            let envelope = match Envelope::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(%peer, stream, error = %e, "Dropping undecodable message");
                    continue;
                }
            };

            match envelope.direction {
                Direction::Request => {
                    let node = self.clone();
                    let channel = Arc::clone(&channel);
                    tokio::spawn(async move {
                        node.answer(peer, &channel, stream, envelope).await;
                    });
                }
                Direction::Response => {
                    let call_id = envelope.call_id;
                    if !self
                        .inner
                        .pending
                        .complete(call_id, channel_id, envelope.into_result())
                    {
                        tracing::debug!(%peer, call_id, "Discarding response for unknown call");
                    }
                }
            }
        }

        self.channel_ended(peer, &channel).await;
    }

    /// Run a request and send the response on the request's stream.
    async fn answer(&self, peer: NodeId, channel: &SecureChannel, stream: StreamId, request: Envelope) {
        let response = if request.version == ENVELOPE_VERSION {
            self.handle_request(peer, channel.peer_addr(), &request).await
        } else {
            Envelope::error_response(&request, Status::BadRequest, "unsupported envelope version")
        };

        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%peer, call_id = request.call_id, error = %e, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = channel.send(stream, bytes).await {
            tracing::debug!(%peer, call_id = request.call_id, error = %e, "Failed to send response");
        }
    }

    async fn handle_request(
        &self,
        peer: NodeId,
        seen_from: Option<SocketAddr>,
        request: &Envelope,
    ) -> Envelope {
        if let Some(response) = self.handle_dht_request(peer, seen_from, request).await {
            return response;
        }

        let handler = self
            .inner
            .handlers
            .get(&request.method)
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            tracing::debug!(%peer, method = %request.method, "Method not found");
            return Envelope::error_response(request, Status::MethodNotFound, &request.method);
        };

        let call = Request {
            peer,
            method: request.method.clone(),
            payload: request.payload.clone(),
        };
        match handler.handle(call).await {
            Ok(payload) => Envelope::response(request, Status::Ok, payload),
            Err(e) => {
                Envelope::error_response(request, Status::ApplicationError(e.code), &e.message)
            }
        }
    }
}
