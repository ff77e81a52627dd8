//! Handshake driver.
//!
//! Runs the `veil_crypto` handshake state machines over a [`RawLink`] and
//! turns the outcome into a [`SecureChannel`]. Either a fully keyed channel
//! is returned or the link is dropped; nothing half-initialized escapes.

use crate::ChannelConfig;
use crate::channel::SecureChannel;
use crate::error::{TransportError, TransportResult};
use crate::link::RawLink;
use veil_crypto::NodeIdentity;
use veil_crypto::handshake::{HandshakeOutcome, Initiator, MAX_MESSAGE_LEN, Responder, Role};

/// Run the authenticated key exchange over `link`.
///
/// The whole exchange is bounded by `config.handshake_timeout`.
///
/// # Errors
///
/// Returns `TransportError::HandshakeFailed` on any verification failure,
/// version mismatch, malformed message, premature close or timeout.
pub async fn perform_handshake(
    identity: &NodeIdentity,
    mut link: RawLink,
    role: Role,
    config: &ChannelConfig,
) -> TransportResult<SecureChannel> {
    let exchange = async {
        match role {
            Role::Initiator => run_initiator(identity, &mut link).await,
            Role::Responder => run_responder(identity, &mut link).await,
        }
    };

    let outcome = match tokio::time::timeout(config.handshake_timeout, exchange).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::debug!(?role, error = %e, "Handshake failed");
            return Err(e);
        }
        Err(_) => {
            tracing::debug!(?role, "Handshake timed out");
            return Err(TransportError::HandshakeFailed("timed out".into()));
        }
    };

    tracing::debug!(
        ?role,
        peer = %hex::encode(&outcome.remote.node_id[..8]),
        "Handshake complete"
    );
    Ok(SecureChannel::from_handshake(link, outcome, role, config))
}

async fn run_initiator(
    identity: &NodeIdentity,
    link: &mut RawLink,
) -> TransportResult<HandshakeOutcome> {
    let (mut initiator, hello) = Initiator::start(identity).map_err(failed)?;
    link.send(hello).await.map_err(io_failed)?;

    let reply = expect_message(link).await?;
    let finish = initiator.on_reply(&reply).map_err(failed)?;
    link.send(finish).await.map_err(io_failed)?;

    let accept = expect_message(link).await?;
    initiator.on_accept(&accept).map_err(failed)
}

async fn run_responder(
    identity: &NodeIdentity,
    link: &mut RawLink,
) -> TransportResult<HandshakeOutcome> {
    let mut responder = Responder::new(identity).map_err(failed)?;

    let hello = expect_message(link).await?;
    let reply = responder.on_hello(&hello).map_err(failed)?;
    link.send(reply).await.map_err(io_failed)?;

    let finish = expect_message(link).await?;
    let (outcome, accept) = responder.on_finish(&finish).map_err(failed)?;
    link.send(accept).await.map_err(io_failed)?;
    Ok(outcome)
}

async fn expect_message(link: &mut RawLink) -> TransportResult<Vec<u8>> {
    match link.recv().await.map_err(io_failed)? {
        Some(msg) if msg.len() <= MAX_MESSAGE_LEN => Ok(msg),
        Some(msg) => Err(TransportError::HandshakeFailed(format!(
            "oversized message ({} bytes)",
            msg.len()
        ))),
        None => Err(TransportError::HandshakeFailed(
            "connection closed during handshake".into(),
        )),
    }
}

fn failed(err: veil_crypto::CryptoError) -> TransportError {
    TransportError::HandshakeFailed(err.to_string())
}

fn io_failed(err: TransportError) -> TransportError {
    match err {
        TransportError::HandshakeFailed(_) => err,
        other => TransportError::HandshakeFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelState, CloseReason};
    use crate::link::TunnelEnd;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use veil_crypto::generate_identity;

    fn config() -> ChannelConfig {
        ChannelConfig {
            handshake_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Wire two tunnel links back to back, letting `tamper` edit the n-th
    /// frame travelling in either direction.
    fn tampered_pair<F>(tamper: F) -> (RawLink, RawLink)
    where
        F: Fn(usize, &mut Vec<u8>) + Send + Sync + 'static,
    {
        let (left, left_end) = RawLink::tunnel(8);
        let (right, right_end) = RawLink::tunnel(8);
        let tamper = Arc::new(tamper);
        let counter = Arc::new(AtomicUsize::new(0));

        let TunnelEnd {
            outbound: left_out,
            inbound: left_in,
        } = left_end;
        let TunnelEnd {
            outbound: right_out,
            inbound: right_in,
        } = right_end;

        for (mut from, to) in [(left_out, right_in), (right_out, left_in)] {
            let tamper = tamper.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                while let Some(mut frame) = from.recv().await {
                    tamper(counter.fetch_add(1, Ordering::SeqCst), &mut frame);
                    if to.send(frame).await.is_err() {
                        break;
                    }
                }
            });
        }
        (left, right)
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();
        let (a, b) = tokio::io::duplex(4096);
        let cfg = config();

        let (ca, cb) = tokio::join!(
            perform_handshake(&alice, RawLink::from_stream(a, 4096, None), Role::Initiator, &cfg),
            perform_handshake(&bob, RawLink::from_stream(b, 4096, None), Role::Responder, &cfg),
        );
        let (ca, cb) = (ca.unwrap(), cb.unwrap());

        assert_eq!(ca.remote().node_id, *bob.node_id());
        assert_eq!(cb.remote().node_id, *alice.node_id());
        assert_eq!(ca.channel_id(), cb.channel_id());
    }

    #[tokio::test]
    async fn test_single_bit_flip_fails_both_sides() {
        // Frames 0..3 are Hello, Reply, Finish, Accept in order.
        for target in 0..4usize {
            let alice = generate_identity().unwrap();
            let bob = generate_identity().unwrap();
            let (left, right) = tampered_pair(move |n, frame| {
                if n == target {
                    let bit = frame.len() * 8 / 2;
                    frame[bit / 8] ^= 1 << (bit % 8);
                }
            });
            let cfg = ChannelConfig {
                handshake_timeout: Duration::from_millis(500),
                ..Default::default()
            };

            let (ra, rb) = tokio::join!(
                perform_handshake(&alice, left, Role::Initiator, &cfg),
                perform_handshake(&bob, right, Role::Responder, &cfg),
            );

            assert!(
                matches!(ra, Err(TransportError::HandshakeFailed(_))),
                "initiator accepted tampered message {target}"
            );
            if target < 3 {
                assert!(
                    matches!(rb, Err(TransportError::HandshakeFailed(_))),
                    "responder accepted tampered message {target}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_tampered_accept_closes_responder_channel() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();
        let (left, right) = tampered_pair(|n, frame| {
            if n == 3 {
                let last = frame.len() - 1;
                frame[last] ^= 0x01;
            }
        });
        let cfg = config();

        let (ra, rb) = tokio::join!(
            perform_handshake(&alice, left, Role::Initiator, &cfg),
            perform_handshake(&bob, right, Role::Responder, &cfg),
        );
        assert!(matches!(ra, Err(TransportError::HandshakeFailed(_))));

        // The responder finished before Accept was checked, so it holds a
        // keyed channel; it must close as soon as the initiator walks away.
        let responder = rb.unwrap();
        let state = tokio::time::timeout(Duration::from_secs(1), responder.closed())
            .await
            .expect("responder channel stayed open");
        assert_eq!(state, ChannelState::Closed(CloseReason::LinkLost));
        assert!(responder.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_times_out_on_silent_peer() {
        let alice = generate_identity().unwrap();
        let (a, _b) = tokio::io::duplex(4096);
        let cfg = ChannelConfig {
            handshake_timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let start = tokio::time::Instant::now();
        let result =
            perform_handshake(&alice, RawLink::from_stream(a, 4096, None), Role::Initiator, &cfg)
                .await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_peer_closing_midway_fails() {
        let alice = generate_identity().unwrap();
        let (a, b) = tokio::io::duplex(4096);
        drop(b);
        let result = perform_handshake(
            &alice,
            RawLink::from_stream(a, 4096, None),
            Role::Initiator,
            &config(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
    }
}
