//! Relay tunnels.
//!
//! A node that cannot dial a peer directly asks a node both can reach to
//! forward for it. Relay control messages ride on stream 0 of the direct
//! channels; the tunnel carries the sealed frames of a second, end-to-end
//! [`SecureChannel`] between the two endpoints, so the relay only ever sees
//! ciphertext.
//!
//! ```text
//!   A ══ channel A-B ══ B ══ channel B-C ══ C
//!   └──────── channel A-C (inside tunnel) ──┘
//! ```
//!
//! Tunnel legs are tracked per channel peer: `(peer, tunnel id)` maps to
//! either a local endpoint (we are A or C) or the opposite leg (we are B).

use crate::error::{NodeError, Result};
use crate::node::Node;
use crate::node::channels::Route;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use veil_discovery::NodeId;
use veil_discovery::relay::{RelayCandidate, RelayErrorCode, RelayMessage, RelaySelector, TunnelId};
use veil_transport::channel::CONTROL_STREAM;
use veil_transport::{ChannelConfig, RawLink, Role, SecureChannel, perform_handshake};

/// Bytes a relay message adds around one tunnelled frame
pub const TUNNEL_OVERHEAD: usize = 64;

/// A frame forwarded by this node, as handed to traffic subscribers.
#[derive(Debug, Clone)]
pub struct RelayedFrame {
    /// Channel peer the frame came from
    pub from: NodeId,
    /// Channel peer the frame went to
    pub to: NodeId,
    /// Frame body exactly as forwarded
    pub bytes: Vec<u8>,
}

/// One leg of a tunnel, keyed by `(channel peer, tunnel id)`.
#[derive(Debug, Clone)]
pub(crate) enum TunnelLeg {
    /// We terminate the tunnel; frames go into the local link
    Endpoint { inbound: mpsc::Sender<Vec<u8>> },
    /// We forward; frames go out on `peer`'s channel under `tunnel`
    Forward { peer: NodeId, tunnel: TunnelId },
}

// ═══════════════════════════════════════════════════════════════════════════
// Opening tunnels
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Reach `dest` through the lowest-latency relay that will forward.
    pub(crate) async fn connect_relayed(&self, dest: &NodeId) -> Result<Arc<SecureChannel>> {
        let relays = self.relay_candidates(dest).await;
        if relays.is_empty() {
            return Err(NodeError::unreachable("no relay available"));
        }

        let mut last_err = None;
        for via in relays {
            match self.open_tunnel(via, dest).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    tracing::debug!(%dest, relay = %via, error = %e, "Relay attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(NodeError::unreachable("no relay available")))
    }

    /// Directly connected peers ranked by measured latency.
    async fn relay_candidates(&self, dest: &NodeId) -> Vec<NodeId> {
        let direct: Vec<NodeId> = self
            .inner
            .channels
            .iter()
            .filter(|entry| entry.route == Route::Direct && entry.channel.is_open())
            .map(|entry| *entry.key())
            .collect();

        let mut selector = RelaySelector::new();
        {
            let routing = self.inner.routing.read().await;
            for id in direct {
                let mut candidate = RelayCandidate::new(id);
                if let Some(rtt) = routing.get(&id).and_then(|peer| peer.rtt) {
                    candidate = candidate.with_latency(rtt);
                }
                selector.add_candidate(candidate);
            }
        }

        selector
            .ranked(self.inner.config.relay.max_attempts, &[*dest])
            .into_iter()
            .map(|candidate| candidate.id)
            .collect()
    }

    /// Ask `via` for a tunnel to `dest` and handshake with `dest` through it.
    async fn open_tunnel(&self, via: NodeId, dest: &NodeId) -> Result<Arc<SecureChannel>> {
        let relay = self
            .direct_channel(&via)
            .ok_or(NodeError::unreachable("relay channel closed"))?;

        let (link, end) = RawLink::tunnel(self.inner.config.relay.tunnel_queue);
        let tunnel = self.free_tunnel_id(&via);
        self.inner.tunnels.insert(
            (via, tunnel),
            TunnelLeg::Endpoint {
                inbound: end.inbound,
            },
        );
        tokio::spawn(self.clone().pump_tunnel(via, tunnel, Arc::clone(&relay), end.outbound));

        if let Err(e) = send_control(&relay, via, &RelayMessage::Open { tunnel, dest: *dest }).await {
            self.inner.tunnels.remove(&(via, tunnel));
            return Err(e);
        }

        let config = self.tunnel_channel_config();
        let channel =
            perform_handshake(&self.inner.identity, link, Role::Initiator, &config).await?;

        let remote = NodeId::from_bytes(channel.remote().node_id);
        if remote != *dest {
            tracing::warn!(%dest, %remote, relay = %via, "Relayed peer has a different identity");
            channel.close().await;
            return Err(NodeError::handshake("peer identity mismatch"));
        }

        Ok(self.install_channel(channel, Route::Relayed { via }))
    }

    /// Move frames the local tunnel link produces onto the relay channel.
    async fn pump_tunnel(
        self,
        via: NodeId,
        tunnel: TunnelId,
        relay: Arc<SecureChannel>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(bytes) = outbound.recv().await {
            if send_control(&relay, via, &RelayMessage::Data { tunnel, bytes })
                .await
                .is_err()
            {
                break;
            }
        }

        // Still registered means the close started on our side.
        if self.inner.tunnels.remove(&(via, tunnel)).is_some() {
            let _ = send_control(&relay, via, &RelayMessage::Close { tunnel }).await;
        }
        tracing::trace!(relay = %via, tunnel, "Tunnel pump stopped");
    }

    fn tunnel_channel_config(&self) -> ChannelConfig {
        let outer = &self.inner.config.channel;
        ChannelConfig {
            max_frame_size: outer.max_payload().saturating_sub(TUNNEL_OVERHEAD),
            ..outer.clone()
        }
    }

    fn free_tunnel_id(&self, peer: &NodeId) -> TunnelId {
        let mut rng = rand::thread_rng();
        loop {
            let tunnel: TunnelId = rng.r#gen();
            if !self.inner.tunnels.contains_key(&(*peer, tunnel)) {
                return tunnel;
            }
        }
    }

    /// Copies of every frame this node forwards for others.
    ///
    /// Frames are observed after forwarding; a slow subscriber misses frames
    /// instead of slowing the tunnel.
    #[must_use]
    pub fn subscribe_relay_traffic(&self) -> broadcast::Receiver<RelayedFrame> {
        self.inner.relay_traffic.subscribe()
    }

    /// Tunnels this node currently forwards
    #[must_use]
    pub fn forwarded_tunnels(&self) -> usize {
        self.inner
            .tunnels
            .iter()
            .filter(|entry| matches!(entry.value(), TunnelLeg::Forward { .. }))
            .count()
            / 2
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Control stream
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Handle one message from stream 0 of the channel to `from`.
    pub(crate) async fn handle_relay_message(
        &self,
        from: NodeId,
        channel: &Arc<SecureChannel>,
        bytes: &[u8],
    ) {
        let message = match RelayMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "Dropping malformed relay message");
                return;
            }
        };
        tracing::trace!(peer = %from, kind = message.message_type(), tunnel = message.tunnel(), "Relay message");

        match message {
            RelayMessage::Open { tunnel, dest } => self.relay_open(from, channel, tunnel, dest).await,
            RelayMessage::Incoming { tunnel, src } => self.relay_incoming(from, channel, tunnel, src),
            RelayMessage::Data { tunnel, bytes } => self.relay_data(from, channel, tunnel, bytes).await,
            RelayMessage::Close { tunnel } => self.relay_close(from, tunnel).await,
            RelayMessage::Error { tunnel, code } => {
                tracing::debug!(peer = %from, tunnel, %code, "Relay refused tunnel");
                // Dropping the endpoint ends the pending handshake.
                self.inner.tunnels.remove(&(from, tunnel));
            }
        }
    }

    /// We are the relay: link `from`'s tunnel to a new leg towards `dest`.
    async fn relay_open(
        &self,
        from: NodeId,
        channel: &SecureChannel,
        tunnel: TunnelId,
        dest: NodeId,
    ) {
        let refuse = |code| RelayMessage::Error { tunnel, code };

        let outcome = if !self.inner.config.relay.enabled {
            Err(RelayErrorCode::RelayDisabled)
        } else if self.inner.tunnels.contains_key(&(from, tunnel)) {
            Err(RelayErrorCode::Refused)
        } else if self.forwarded_tunnels() >= self.inner.config.relay.max_tunnels {
            Err(RelayErrorCode::TooManyTunnels)
        } else if dest == from || dest == self.inner.local_id {
            Err(RelayErrorCode::DestinationUnreachable)
        } else {
            self.direct_channel(&dest)
                .ok_or(RelayErrorCode::DestinationUnreachable)
        };

        let next = match outcome {
            Ok(next) => next,
            Err(code) => {
                tracing::debug!(src = %from, %dest, %code, "Refusing tunnel");
                let _ = send_control(channel, from, &refuse(code)).await;
                return;
            }
        };

        let onward = self.free_tunnel_id(&dest);
        self.inner.tunnels.insert(
            (from, tunnel),
            TunnelLeg::Forward {
                peer: dest,
                tunnel: onward,
            },
        );
        self.inner.tunnels.insert(
            (dest, onward),
            TunnelLeg::Forward {
                peer: from,
                tunnel,
            },
        );

        let announce = RelayMessage::Incoming {
            tunnel: onward,
            src: from,
        };
        if send_control(&next, dest, &announce).await.is_err() {
            self.inner.tunnels.remove(&(from, tunnel));
            self.inner.tunnels.remove(&(dest, onward));
            let _ = send_control(channel, from, &refuse(RelayErrorCode::DestinationUnreachable)).await;
            return;
        }

        tracing::info!(src = %from, %dest, "Relaying tunnel");
    }

    /// We are the destination: answer the handshake arriving through `from`.
    fn relay_incoming(
        &self,
        from: NodeId,
        channel: &Arc<SecureChannel>,
        tunnel: TunnelId,
        src: NodeId,
    ) {
        if !self.inner.config.relay.enabled || src == self.inner.local_id {
            let channel = Arc::clone(channel);
            tokio::spawn(async move {
                let refusal = RelayMessage::Error {
                    tunnel,
                    code: RelayErrorCode::Refused,
                };
                let _ = send_control(&channel, from, &refusal).await;
            });
            return;
        }

        let (link, end) = RawLink::tunnel(self.inner.config.relay.tunnel_queue);
        self.inner.tunnels.insert(
            (from, tunnel),
            TunnelLeg::Endpoint {
                inbound: end.inbound,
            },
        );
        tokio::spawn(self.clone().pump_tunnel(from, tunnel, Arc::clone(channel), end.outbound));

        // The dispatcher must keep feeding the tunnel while the handshake runs.
        let node = self.clone();
        tokio::spawn(async move {
            let config = node.tunnel_channel_config();
            match perform_handshake(&node.inner.identity, link, Role::Responder, &config).await {
                Ok(inner) => {
                    let remote = NodeId::from_bytes(inner.remote().node_id);
                    if remote == src {
                        node.install_channel(inner, Route::Relayed { via: from });
                    } else {
                        tracing::warn!(%src, %remote, relay = %from, "Tunnel peer is not the announced source");
                        inner.close().await;
                    }
                }
                Err(e) => {
                    tracing::debug!(%src, relay = %from, error = %e, "Relayed handshake failed");
                }
            }
        });
    }

    async fn relay_data(
        &self,
        from: NodeId,
        channel: &SecureChannel,
        tunnel: TunnelId,
        bytes: Vec<u8>,
    ) {
        let leg = self
            .inner
            .tunnels
            .get(&(from, tunnel))
            .map(|entry| entry.value().clone());

        match leg {
            Some(TunnelLeg::Endpoint { inbound }) => {
                if inbound.send(bytes).await.is_err() {
                    self.inner.tunnels.remove(&(from, tunnel));
                    let _ = send_control(channel, from, &RelayMessage::Close { tunnel }).await;
                }
            }
            Some(TunnelLeg::Forward { peer, tunnel: onward }) => {
                let Some(next) = self.direct_channel(&peer) else {
                    self.relay_close(from, tunnel).await;
                    let _ = send_control(channel, from, &RelayMessage::Close { tunnel }).await;
                    return;
                };

                if self.inner.relay_traffic.receiver_count() > 0 {
                    let _ = self.inner.relay_traffic.send(RelayedFrame {
                        from,
                        to: peer,
                        bytes: bytes.clone(),
                    });
                }

                let forward = RelayMessage::Data {
                    tunnel: onward,
                    bytes,
                };
                if send_control(&next, peer, &forward).await.is_err() {
                    self.relay_close(from, tunnel).await;
                    let _ = send_control(channel, from, &RelayMessage::Close { tunnel }).await;
                }
            }
            None => {
                tracing::trace!(peer = %from, tunnel, "Data for unknown tunnel");
            }
        }
    }

    /// Drop the leg `(from, tunnel)` and, when forwarding, its opposite leg.
    async fn relay_close(&self, from: NodeId, tunnel: TunnelId) {
        let Some((_, leg)) = self.inner.tunnels.remove(&(from, tunnel)) else {
            return;
        };
        if let TunnelLeg::Forward { peer, tunnel: onward } = leg {
            self.inner.tunnels.remove(&(peer, onward));
            if let Some(next) = self.direct_channel(&peer) {
                let _ = send_control(&next, peer, &RelayMessage::Close { tunnel: onward }).await;
            }
            tracing::debug!(src = %from, dest = %peer, "Tunnel closed");
        }
    }

    /// Tear down every tunnel leg that ran over the channel to `peer`.
    pub(crate) async fn drop_tunnels_of(&self, peer: NodeId) {
        let legs: Vec<TunnelId> = self
            .inner
            .tunnels
            .iter()
            .filter(|entry| entry.key().0 == peer)
            .map(|entry| entry.key().1)
            .collect();

        for tunnel in legs {
            self.relay_close(peer, tunnel).await;
        }
    }
}

async fn send_control(channel: &SecureChannel, peer: NodeId, message: &RelayMessage) -> Result<()> {
    let bytes = message.to_bytes()?;
    channel
        .send(CONTROL_STREAM, bytes)
        .await
        .map_err(|e| NodeError::from_channel(peer, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::test_util::{fast_config, spawn_node};
    use crate::rpc::{HandlerError, Request};
    use std::time::Duration;
    use veil_transport::memory::MemoryNetwork;

    /// a and c cannot dial each other; both know b.
    async fn triangle(relay_config: NodeConfig) -> (MemoryNetwork, Node, Node, Node) {
        let net = MemoryNetwork::default();
        let a = spawn_node(&net, fast_config()).await;
        let b = spawn_node(&net, relay_config).await;
        let c = spawn_node(&net, fast_config()).await;
        net.partition(a.local_addr(), c.local_addr());

        c.bootstrap(&[b.local_addr()]).await;
        a.ping_with_hints(&b.local_id(), &[b.local_addr()], Duration::from_secs(2))
            .await
            .unwrap();
        (net, a, b, c)
    }

    #[tokio::test]
    async fn test_tunnel_through_relay() {
        let (_net, a, b, c) = triangle(fast_config()).await;
        c.serve("greet", |req: Request| async move {
            let mut reply = b"hello ".to_vec();
            reply.extend_from_slice(&req.payload);
            Ok::<_, HandlerError>(reply)
        })
        .unwrap();

        let channel = a.connect_relayed(&c.local_id()).await.unwrap();
        assert_eq!(channel.link_kind(), veil_transport::LinkKind::Tunnel);
        assert_eq!(
            a.route_to(&c.local_id()),
            Some(Route::Relayed { via: b.local_id() })
        );
        assert_eq!(b.forwarded_tunnels(), 1);

        let reply = a
            .call(&c.local_id(), "greet", b"a".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"hello a");
    }

    #[tokio::test]
    async fn test_relay_disabled_refuses() {
        let mut config = fast_config();
        config.relay.enabled = false;
        let (_net, a, _b, c) = triangle(config).await;

        let err = a.connect_relayed(&c.local_id()).await.unwrap_err();
        assert!(matches!(err, NodeError::HandshakeFailed(_)), "{err:?}");
        assert!(a.route_to(&c.local_id()).is_none());
    }

    #[tokio::test]
    async fn test_unknown_destination_refused() {
        let (_net, a, b, _c) = triangle(fast_config()).await;

        let stranger = NodeId::random();
        assert!(a.connect_relayed(&stranger).await.is_err());
        assert_eq!(b.forwarded_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_relay_loss_ends_tunnelled_channel() {
        let (_net, a, b, c) = triangle(fast_config()).await;
        let channel = a.connect_relayed(&c.local_id()).await.unwrap();

        b.shutdown().await;
        let state = tokio::time::timeout(Duration::from_secs(2), channel.closed())
            .await
            .unwrap();
        assert!(!state.is_open());
    }

    #[test]
    fn test_tunnel_config_fits_outer_frame() {
        let outer = ChannelConfig::default();
        let inner_max = outer.max_payload() - TUNNEL_OVERHEAD;
        // An inner frame plus the Data message header must fit one outer payload.
        let message = RelayMessage::Data {
            tunnel: u64::MAX,
            bytes: vec![0; inner_max],
        };
        assert!(message.to_bytes().unwrap().len() <= outer.max_payload());
    }
}
