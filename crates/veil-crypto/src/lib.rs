//! # VEIL Crypto
//!
//! Cryptographic primitives for the VEIL network core.
//!
//! This crate provides:
//! - Node identities (Ed25519) and node ID derivation
//! - The signed Diffie-Hellman handshake with MAC key confirmation
//! - `XChaCha20-Poly1305` frame encryption with strict sequence checks
//! - Passphrase-protected identity export (Argon2id + `XChaCha20-Poly1305`)
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 (ephemeral) | 128-bit |
//! | Authentication | Ed25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / MAC | BLAKE3 (keyed) | 128-bit collision |
//! | KDF | HKDF-BLAKE3 | 128-bit |
//! | Key Encryption | Argon2id + XChaCha20-Poly1305 | 256-bit |
//!
//! The handshake is exposed as sans-IO state machines ([`handshake::Initiator`]
//! and [`handshake::Responder`]); driving them over a connection is the job of
//! the transport crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod constant_time;
pub mod encrypted_identity;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod identity;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;
pub use identity::{NodeIdentity, PublicIdentity, derive_node_id, generate_identity, load_identity};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Node ID size (256 bits)
pub const NODE_ID_SIZE: usize = 32;

/// Session keys derived from a completed handshake.
///
/// Directional keys are already oriented for the local side: `send_key`
/// encrypts what this node sends, `recv_key` decrypts what it receives.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for sending data
    pub send_key: [u8; 32],
    /// Key for receiving data
    pub recv_key: [u8; 32],
    /// Chain key, used to derive nonce salts and the channel ID
    pub chain_key: [u8; 32],
}

impl SessionKeys {
    /// Derive a short channel identifier shared by both ends.
    #[must_use]
    pub fn derive_channel_id(&self) -> [u8; 8] {
        let hash = blake3::hash(&self.chain_key);
        let mut cid = [0u8; 8];
        cid.copy_from_slice(&hash.as_bytes()[..8]);
        cid
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("channel_id", &hex::encode(self.derive_channel_id()))
            .finish_non_exhaustive()
    }
}
