//! Mutually authenticated key exchange.
//!
//! Signed ephemeral Diffie-Hellman with MAC key confirmation, in four
//! messages:
//!
//! ```text
//! Initiator                                        Responder
//!   Hello   { version, e_i, n_i }            ->
//!           <-  Reply { version, e_r, n_r, pk_r, sig_r, mac_r }
//!   Finish  { pk_i, sig_i, mac_i }           ->
//!           <-  Accept { mac_a }
//! ```
//!
//! - `sig_x` = Ed25519 over `label ∥ role ∥ own ephemeral ∥ own node ID ∥
//!   peer nonce ∥ transcript hash`.
//! - Keys come from HKDF-BLAKE3 over `X25519(e_i, e_r)`, salted with the
//!   transcript hash once both ephemerals and nonces are known.
//! - `mac_x` = keyed BLAKE3 under the confirmation key over the transcript.
//!
//! Every message is absorbed into a running [`Transcript`]; flipping any bit
//! of `Hello`, `Reply` or `Finish` makes the receiving side's verification
//! fail, and the sender of the tampered-with message then never receives the
//! message it waits for.
//!
//! The state machines here do no I/O. The caller moves bytes and applies the
//! overall timeout.

use crate::constant_time::ct_eq;
use crate::hash::{Transcript, hkdf_expand_key, hkdf_extract, mac};
use crate::identity::{NodeIdentity, PublicIdentity};
use crate::signatures::Signature;
use crate::x25519::{EphemeralSecret, PublicKey};
use crate::{CryptoError, SessionKeys};
use rand_core::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Handshake protocol version carried in `Hello` and `Reply`.
pub const PROTOCOL_VERSION: u8 = 1;

const TRANSCRIPT_LABEL: &[u8] = b"veil-handshake-v1";
const SIGNATURE_LABEL: &[u8] = b"veil-hs-sig";

const MSG_HELLO: u8 = 1;
const MSG_REPLY: u8 = 2;
const MSG_FINISH: u8 = 3;
const MSG_ACCEPT: u8 = 4;

/// Size of an encoded `Hello`.
pub const HELLO_LEN: usize = 1 + 1 + 32 + 32;
const REPLY_CORE_LEN: usize = 1 + 1 + 32 + 32 + 32;
/// Size of an encoded `Reply`.
pub const REPLY_LEN: usize = REPLY_CORE_LEN + 64 + 32;
const FINISH_CORE_LEN: usize = 1 + 32;
/// Size of an encoded `Finish`.
pub const FINISH_LEN: usize = FINISH_CORE_LEN + 64 + 32;
/// Size of an encoded `Accept`.
pub const ACCEPT_LEN: usize = 1 + 32;

/// Largest handshake message; transports can bound reads with it.
pub const MAX_MESSAGE_LEN: usize = REPLY_LEN;

/// Which side of the exchange this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends `Hello` and `Finish`
    Initiator,
    /// Sends `Reply` and `Accept`
    Responder,
}

impl Role {
    fn tag(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"initiator",
            Role::Responder => b"responder",
        }
    }
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Session keys oriented for the local side
    pub keys: SessionKeys,
    /// Authenticated identity of the remote node
    pub remote: PublicIdentity,
    /// Final transcript hash (identical on both sides)
    pub transcript_hash: [u8; 32],
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKeys {
    initiator_to_responder: [u8; 32],
    responder_to_initiator: [u8; 32],
    confirm: [u8; 32],
    chain: [u8; 32],
}

impl DerivedKeys {
    fn derive(
        secret: &EphemeralSecret,
        peer: &PublicKey,
        transcript_hash: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let shared = secret
            .diffie_hellman(peer)
            .map_err(|_| CryptoError::HandshakeFailed("low-order ephemeral key"))?;
        let mut prk = hkdf_extract(transcript_hash, shared.as_bytes());
        let keys = Self {
            initiator_to_responder: hkdf_expand_key(&prk, b"veil i2r"),
            responder_to_initiator: hkdf_expand_key(&prk, b"veil r2i"),
            confirm: hkdf_expand_key(&prk, b"veil confirm"),
            chain: hkdf_expand_key(&prk, b"veil chain"),
        };
        prk.zeroize();
        Ok(keys)
    }

    fn session_keys(&self, role: Role) -> SessionKeys {
        let (send_key, recv_key) = match role {
            Role::Initiator => (self.initiator_to_responder, self.responder_to_initiator),
            Role::Responder => (self.responder_to_initiator, self.initiator_to_responder),
        };
        SessionKeys {
            send_key,
            recv_key,
            chain_key: self.chain,
        }
    }
}

fn signed_payload(
    role: Role,
    ephemeral: &[u8; 32],
    node_id: &[u8; 32],
    peer_nonce: &[u8; 32],
    transcript_hash: &[u8; 32],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SIGNATURE_LABEL.len() + 9 + 32 * 4);
    payload.extend_from_slice(SIGNATURE_LABEL);
    payload.extend_from_slice(role.tag());
    payload.extend_from_slice(ephemeral);
    payload.extend_from_slice(node_id);
    payload.extend_from_slice(peer_nonce);
    payload.extend_from_slice(transcript_hash);
    payload
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

fn check_frame(message: &[u8], kind: u8, len: usize) -> Result<(), CryptoError> {
    if message.len() != len {
        return Err(CryptoError::HandshakeFailed("malformed message length"));
    }
    if message[0] != kind {
        return Err(CryptoError::HandshakeFailed("unexpected message type"));
    }
    Ok(())
}

fn check_version(version: u8) -> Result<(), CryptoError> {
    if version != PROTOCOL_VERSION {
        return Err(CryptoError::HandshakeFailed("protocol version mismatch"));
    }
    Ok(())
}

fn verify_tag(key: &[u8; 32], parts: &[&[u8]], tag: &[u8; 32]) -> Result<(), CryptoError> {
    if ct_eq(&mac(key, parts), tag) {
        Ok(())
    } else {
        Err(CryptoError::HandshakeFailed("key confirmation mismatch"))
    }
}

enum InitiatorState {
    AwaitReply,
    AwaitAccept {
        keys: DerivedKeys,
        remote: PublicIdentity,
    },
    Done,
}

/// Initiator side of the handshake.
pub struct Initiator {
    identity: NodeIdentity,
    ephemeral: EphemeralSecret,
    ephemeral_public: [u8; 32],
    nonce: [u8; 32],
    transcript: Transcript,
    state: InitiatorState,
}

impl Initiator {
    /// Begin a handshake, returning the state machine and the `Hello` message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if no nonce can be drawn.
    pub fn start(identity: &NodeIdentity) -> Result<(Self, Vec<u8>), CryptoError> {
        let ephemeral = EphemeralSecret::generate(&mut OsRng);
        let ephemeral_public = *ephemeral.public_key().as_bytes();
        let nonce = crate::random::random_32()?;

        let mut hello = Vec::with_capacity(HELLO_LEN);
        hello.push(MSG_HELLO);
        hello.push(PROTOCOL_VERSION);
        hello.extend_from_slice(&ephemeral_public);
        hello.extend_from_slice(&nonce);

        let mut transcript = Transcript::new(TRANSCRIPT_LABEL);
        transcript.absorb(&hello);

        Ok((
            Self {
                identity: identity.clone(),
                ephemeral,
                ephemeral_public,
                nonce,
                transcript,
                state: InitiatorState::AwaitReply,
            },
            hello,
        ))
    }

    /// Process the responder's `Reply`, returning the `Finish` message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HandshakeFailed` on any verification failure and
    /// `CryptoError::InvalidState` if called out of order.
    pub fn on_reply(&mut self, reply: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !matches!(self.state, InitiatorState::AwaitReply) {
            return Err(CryptoError::InvalidState);
        }
        check_frame(reply, MSG_REPLY, REPLY_LEN)?;
        check_version(reply[1])?;

        let peer_ephemeral: [u8; 32] = read_array(reply, 2);
        let peer_nonce: [u8; 32] = read_array(reply, 34);
        let peer_public_key: [u8; 32] = read_array(reply, 66);
        let signature = Signature::from_bytes(read_array(reply, REPLY_CORE_LEN));
        let tag: [u8; 32] = read_array(reply, REPLY_CORE_LEN + 64);

        self.transcript.absorb(&reply[..REPLY_CORE_LEN]);
        let th_reply = self.transcript.current();

        let remote = PublicIdentity::from_public_key(peer_public_key)
            .map_err(|_| CryptoError::HandshakeFailed("invalid responder key"))?;
        remote
            .verify(
                &signed_payload(
                    Role::Responder,
                    &peer_ephemeral,
                    &remote.node_id,
                    &self.nonce,
                    &th_reply,
                ),
                &signature,
            )
            .map_err(|_| CryptoError::HandshakeFailed("responder signature invalid"))?;

        let keys = DerivedKeys::derive(
            &self.ephemeral,
            &PublicKey::from_bytes(peer_ephemeral),
            &th_reply,
        )?;
        verify_tag(
            &keys.confirm,
            &[Role::Responder.tag(), &th_reply, signature.as_bytes()],
            &tag,
        )?;
        self.transcript.absorb(&reply[REPLY_CORE_LEN..]);

        let th_finish = self.transcript.current();
        let own_public = *self.identity.public_key();
        let own_signature = self.identity.sign(&signed_payload(
            Role::Initiator,
            &self.ephemeral_public,
            self.identity.node_id(),
            &peer_nonce,
            &th_finish,
        ));
        let own_tag = mac(
            &keys.confirm,
            &[
                Role::Initiator.tag(),
                &th_finish,
                &own_public,
                own_signature.as_bytes(),
            ],
        );

        let mut finish = Vec::with_capacity(FINISH_LEN);
        finish.push(MSG_FINISH);
        finish.extend_from_slice(&own_public);
        finish.extend_from_slice(own_signature.as_bytes());
        finish.extend_from_slice(&own_tag);
        self.transcript.absorb(&finish);

        self.state = InitiatorState::AwaitAccept { keys, remote };
        Ok(finish)
    }

    /// Process the responder's `Accept`, completing the handshake.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HandshakeFailed` if the final confirmation does
    /// not verify, `CryptoError::InvalidState` if called out of order.
    pub fn on_accept(mut self, accept: &[u8]) -> Result<HandshakeOutcome, CryptoError> {
        let InitiatorState::AwaitAccept { keys, remote } =
            std::mem::replace(&mut self.state, InitiatorState::Done)
        else {
            return Err(CryptoError::InvalidState);
        };
        check_frame(accept, MSG_ACCEPT, ACCEPT_LEN)?;

        let th_final = self.transcript.current();
        let tag: [u8; 32] = read_array(accept, 1);
        verify_tag(&keys.confirm, &[b"accept", &th_final], &tag)?;

        Ok(HandshakeOutcome {
            keys: keys.session_keys(Role::Initiator),
            remote,
            transcript_hash: th_final,
        })
    }
}

enum ResponderState {
    AwaitHello,
    AwaitFinish {
        keys: DerivedKeys,
        peer_ephemeral: [u8; 32],
    },
    Done,
}

/// Responder side of the handshake.
pub struct Responder {
    identity: NodeIdentity,
    ephemeral: EphemeralSecret,
    ephemeral_public: [u8; 32],
    nonce: [u8; 32],
    transcript: Transcript,
    state: ResponderState,
}

impl Responder {
    /// Prepare to answer an incoming handshake.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if no nonce can be drawn.
    pub fn new(identity: &NodeIdentity) -> Result<Self, CryptoError> {
        let ephemeral = EphemeralSecret::generate(&mut OsRng);
        Ok(Self {
            identity: identity.clone(),
            ephemeral_public: *ephemeral.public_key().as_bytes(),
            ephemeral,
            nonce: crate::random::random_32()?,
            transcript: Transcript::new(TRANSCRIPT_LABEL),
            state: ResponderState::AwaitHello,
        })
    }

    /// Process `Hello`, returning the `Reply` message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HandshakeFailed` on malformed input or version
    /// mismatch, `CryptoError::InvalidState` if called out of order.
    pub fn on_hello(&mut self, hello: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !matches!(self.state, ResponderState::AwaitHello) {
            return Err(CryptoError::InvalidState);
        }
        check_frame(hello, MSG_HELLO, HELLO_LEN)?;
        check_version(hello[1])?;

        let peer_ephemeral: [u8; 32] = read_array(hello, 2);
        let peer_nonce: [u8; 32] = read_array(hello, 34);
        self.transcript.absorb(hello);

        let mut reply = Vec::with_capacity(REPLY_LEN);
        reply.push(MSG_REPLY);
        reply.push(PROTOCOL_VERSION);
        reply.extend_from_slice(&self.ephemeral_public);
        reply.extend_from_slice(&self.nonce);
        reply.extend_from_slice(self.identity.public_key());
        self.transcript.absorb(&reply);
        let th_reply = self.transcript.current();

        let keys = DerivedKeys::derive(
            &self.ephemeral,
            &PublicKey::from_bytes(peer_ephemeral),
            &th_reply,
        )?;
        let signature = self.identity.sign(&signed_payload(
            Role::Responder,
            &self.ephemeral_public,
            self.identity.node_id(),
            &peer_nonce,
            &th_reply,
        ));
        let tag = mac(
            &keys.confirm,
            &[Role::Responder.tag(), &th_reply, signature.as_bytes()],
        );

        let tail_start = reply.len();
        reply.extend_from_slice(signature.as_bytes());
        reply.extend_from_slice(&tag);
        self.transcript.absorb(&reply[tail_start..]);

        self.state = ResponderState::AwaitFinish {
            keys,
            peer_ephemeral,
        };
        Ok(reply)
    }

    /// Process `Finish`, returning the outcome and the `Accept` message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HandshakeFailed` if the initiator's identity,
    /// signature or confirmation MAC does not verify.
    pub fn on_finish(
        mut self,
        finish: &[u8],
    ) -> Result<(HandshakeOutcome, Vec<u8>), CryptoError> {
        let ResponderState::AwaitFinish {
            keys,
            peer_ephemeral,
        } = std::mem::replace(&mut self.state, ResponderState::Done)
        else {
            return Err(CryptoError::InvalidState);
        };
        check_frame(finish, MSG_FINISH, FINISH_LEN)?;

        let peer_public_key: [u8; 32] = read_array(finish, 1);
        let signature = Signature::from_bytes(read_array(finish, FINISH_CORE_LEN));
        let tag: [u8; 32] = read_array(finish, FINISH_CORE_LEN + 64);
        let th_finish = self.transcript.current();

        let remote = PublicIdentity::from_public_key(peer_public_key)
            .map_err(|_| CryptoError::HandshakeFailed("invalid initiator key"))?;
        remote
            .verify(
                &signed_payload(
                    Role::Initiator,
                    &peer_ephemeral,
                    &remote.node_id,
                    &self.nonce,
                    &th_finish,
                ),
                &signature,
            )
            .map_err(|_| CryptoError::HandshakeFailed("initiator signature invalid"))?;
        verify_tag(
            &keys.confirm,
            &[
                Role::Initiator.tag(),
                &th_finish,
                &peer_public_key,
                signature.as_bytes(),
            ],
            &tag,
        )?;
        self.transcript.absorb(finish);

        let th_final = self.transcript.current();
        let mut accept = Vec::with_capacity(ACCEPT_LEN);
        accept.push(MSG_ACCEPT);
        accept.extend_from_slice(&mac(&keys.confirm, &[b"accept", &th_final]));

        Ok((
            HandshakeOutcome {
                keys: keys.session_keys(Role::Responder),
                remote,
                transcript_hash: th_final,
            },
            accept,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_identity;

    struct Run {
        initiator: Result<HandshakeOutcome, CryptoError>,
        responder: Result<HandshakeOutcome, CryptoError>,
    }

    /// Run a full exchange, letting `tamper` modify message `index` (0-3).
    fn run(tamper: impl Fn(usize, &mut Vec<u8>)) -> Run {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();
        let lost = || Err(CryptoError::HandshakeFailed("connection closed"));

        let (mut initiator, mut hello) = Initiator::start(&alice).unwrap();
        let mut responder = Responder::new(&bob).unwrap();
        tamper(0, &mut hello);

        let mut reply = match responder.on_hello(&hello) {
            Ok(reply) => reply,
            Err(e) => return Run { initiator: lost(), responder: Err(e) },
        };
        tamper(1, &mut reply);

        let mut finish = match initiator.on_reply(&reply) {
            Ok(finish) => finish,
            Err(e) => return Run { initiator: Err(e), responder: lost() },
        };
        tamper(2, &mut finish);

        let (responder_outcome, mut accept) = match responder.on_finish(&finish) {
            Ok(done) => done,
            Err(e) => return Run { initiator: lost(), responder: Err(e) },
        };
        tamper(3, &mut accept);

        Run {
            initiator: initiator.on_accept(&accept),
            responder: Ok(responder_outcome),
        }
    }

    #[test]
    fn test_handshake_derives_symmetric_keys() {
        let run = run(|_, _| {});
        let i = run.initiator.unwrap();
        let r = run.responder.unwrap();

        assert_eq!(i.keys.send_key, r.keys.recv_key);
        assert_eq!(i.keys.recv_key, r.keys.send_key);
        assert_eq!(i.keys.chain_key, r.keys.chain_key);
        assert_ne!(i.keys.send_key, i.keys.recv_key);
        assert_eq!(i.transcript_hash, r.transcript_hash);
    }

    #[test]
    fn test_handshake_authenticates_both_identities() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();

        let (mut initiator, hello) = Initiator::start(&alice).unwrap();
        let mut responder = Responder::new(&bob).unwrap();
        let reply = responder.on_hello(&hello).unwrap();
        let finish = initiator.on_reply(&reply).unwrap();
        let (r, accept) = responder.on_finish(&finish).unwrap();
        let i = initiator.on_accept(&accept).unwrap();

        assert_eq!(i.remote, bob.public());
        assert_eq!(r.remote, alice.public());
    }

    #[test]
    fn test_every_transcript_bit_flip_fails_both_sides() {
        for (index, len) in [(0, HELLO_LEN), (1, REPLY_LEN), (2, FINISH_LEN)] {
            for byte in 0..len {
                for bit in [0u8, 3, 7] {
                    let run = run(|i, msg| {
                        if i == index {
                            msg[byte] ^= 1 << bit;
                        }
                    });
                    assert!(
                        matches!(run.initiator, Err(CryptoError::HandshakeFailed(_))),
                        "initiator accepted flip in message {index} byte {byte} bit {bit}"
                    );
                    assert!(
                        matches!(run.responder, Err(CryptoError::HandshakeFailed(_))),
                        "responder accepted flip in message {index} byte {byte} bit {bit}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_tampered_accept_fails_initiator() {
        let run = run(|i, msg| {
            if i == 3 {
                msg[5] ^= 0x10;
            }
        });
        assert!(matches!(run.initiator, Err(CryptoError::HandshakeFailed(_))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();
        let (_initiator, mut hello) = Initiator::start(&alice).unwrap();
        hello[1] = PROTOCOL_VERSION + 1;

        let mut responder = Responder::new(&bob).unwrap();
        assert_eq!(
            responder.on_hello(&hello).unwrap_err(),
            CryptoError::HandshakeFailed("protocol version mismatch")
        );
    }

    #[test]
    fn test_truncated_message_rejected() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();
        let (_initiator, hello) = Initiator::start(&alice).unwrap();

        let mut responder = Responder::new(&bob).unwrap();
        assert!(matches!(
            responder.on_hello(&hello[..HELLO_LEN - 1]),
            Err(CryptoError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let alice = generate_identity().unwrap();
        let (initiator, _hello) = Initiator::start(&alice).unwrap();
        assert!(matches!(
            initiator.on_accept(&[MSG_ACCEPT; ACCEPT_LEN]),
            Err(CryptoError::InvalidState)
        ));
    }

    #[test]
    fn test_replayed_reply_from_other_session_rejected() {
        let alice = generate_identity().unwrap();
        let bob = generate_identity().unwrap();

        let (_first, hello1) = Initiator::start(&alice).unwrap();
        let mut responder = Responder::new(&bob).unwrap();
        let stale_reply = responder.on_hello(&hello1).unwrap();

        let (mut second, _hello2) = Initiator::start(&alice).unwrap();
        assert!(matches!(
            second.on_reply(&stale_reply),
            Err(CryptoError::HandshakeFailed(_))
        ));
    }
}
