//! BLAKE3 hashing, keyed MACs and key derivation.
//!
//! Provides:
//! - Plain hashing
//! - A running handshake transcript hash
//! - Keyed-BLAKE3 MACs with constant-time verification
//! - HKDF-style extract/expand built on keyed BLAKE3

use crate::constant_time::ct_eq;

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Running hash over every handshake message, in order.
///
/// Each absorbed message is length-prefixed so boundaries are unambiguous.
#[derive(Clone)]
pub struct Transcript {
    hasher: blake3::Hasher,
    messages: usize,
}

impl Transcript {
    /// Start a transcript under a protocol label.
    #[must_use]
    pub fn new(label: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(label.len() as u32).to_be_bytes());
        hasher.update(label);
        Self {
            hasher,
            messages: 0,
        }
    }

    /// Absorb one message.
    pub fn absorb(&mut self, message: &[u8]) {
        self.hasher.update(&(message.len() as u32).to_be_bytes());
        self.hasher.update(message);
        self.messages += 1;
    }

    /// Number of messages absorbed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
    }

    /// True if nothing has been absorbed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    /// Hash of everything absorbed so far. The transcript stays usable.
    #[must_use]
    pub fn current(&self) -> HashOutput {
        *self.hasher.finalize().as_bytes()
    }
}

/// Keyed-BLAKE3 MAC.
#[must_use]
pub fn mac(key: &[u8; 32], parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new_keyed(key);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Verify a keyed-BLAKE3 MAC in constant time.
#[must_use]
pub fn verify_mac(key: &[u8; 32], parts: &[&[u8]], tag: &[u8]) -> bool {
    ct_eq(&mac(key, parts), tag)
}

/// HKDF-Extract: pseudorandom key from input key material.
///
/// Same shape as RFC 5869 extract, with keyed BLAKE3 in place of HMAC.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        hash(ikm)
    } else {
        let salt_hash = hash(salt);
        let mut hasher = blake3::Hasher::new_keyed(&salt_hash);
        hasher.update(ikm);
        *hasher.finalize().as_bytes()
    }
}

/// HKDF-Expand: expand a pseudorandom key into arbitrary-length output.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);
    hasher.finalize_xof().fill(output);
}

/// Expand a single 32-byte key under `info`.
#[must_use]
pub fn hkdf_expand_key(prk: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    hkdf_expand(prk, info, &mut out);
    out
}
