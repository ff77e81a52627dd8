//! Directional frame ciphers for an established channel.
//!
//! A channel owns one [`SendCipher`] (writer side) and one [`RecvCipher`]
//! (reader side). Every sealed frame carries an explicit 64-bit sequence
//! number that is also the AEAD nonce counter and part of the associated
//! data. The receiver accepts only the next expected sequence number: the
//! substrate is reliable and ordered, so a gap, repeat or reordering can only
//! mean tampering.

use super::{AeadKey, COMMITMENT_SIZE, Nonce};
use crate::{CryptoError, SessionKeys};
use zeroize::ZeroizeOnDrop;

/// Sealing stops before the counter can wrap.
const MAX_SEQUENCE: u64 = u64::MAX - 1;

fn nonce_salt(chain_key: &[u8; 32]) -> [u8; 16] {
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&blake3::keyed_hash(chain_key, b"veil-nonce-salt").as_bytes()[..16]);
    salt
}

fn frame_aad(commitment: &[u8; COMMITMENT_SIZE], sequence: u64) -> [u8; COMMITMENT_SIZE + 8] {
    let mut aad = [0u8; COMMITMENT_SIZE + 8];
    aad[..COMMITMENT_SIZE].copy_from_slice(commitment);
    aad[COMMITMENT_SIZE..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

/// Split session keys into the two directional ciphers.
#[must_use]
pub fn split_session(keys: &SessionKeys) -> (SendCipher, RecvCipher) {
    let salt = nonce_salt(&keys.chain_key);
    (
        SendCipher::new(keys.send_key, salt),
        RecvCipher::new(keys.recv_key, salt),
    )
}

/// Outbound half: assigns sequence numbers and encrypts.
#[derive(ZeroizeOnDrop)]
pub struct SendCipher {
    key: AeadKey,
    #[zeroize(skip)]
    commitment: [u8; COMMITMENT_SIZE],
    salt: [u8; 16],
    #[zeroize(skip)]
    next_sequence: u64,
}

impl SendCipher {
    /// Create from a raw key and nonce salt.
    #[must_use]
    pub fn new(key: [u8; 32], salt: [u8; 16]) -> Self {
        let key = AeadKey::new(key);
        Self {
            commitment: key.commitment(),
            key,
            salt,
            next_sequence: 0,
        }
    }

    /// Sequence number the next sealed frame will carry.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Encrypt one frame, returning its sequence number and ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NonceOverflow` once the sequence space is spent,
    /// or `CryptoError::EncryptionFailed`.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<(u64, Vec<u8>), CryptoError> {
        let sequence = self.next_sequence;
        if sequence >= MAX_SEQUENCE {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(sequence, &self.salt);
        let ciphertext =
            self.key
                .encrypt(&nonce, plaintext, &frame_aad(&self.commitment, sequence))?;
        self.next_sequence += 1;
        Ok((sequence, ciphertext))
    }
}

/// Inbound half: enforces the next-expected sequence and decrypts.
#[derive(ZeroizeOnDrop)]
pub struct RecvCipher {
    key: AeadKey,
    #[zeroize(skip)]
    commitment: [u8; COMMITMENT_SIZE],
    salt: [u8; 16],
    #[zeroize(skip)]
    expected_sequence: u64,
}

impl RecvCipher {
    /// Create from a raw key and nonce salt.
    #[must_use]
    pub fn new(key: [u8; 32], salt: [u8; 16]) -> Self {
        let key = AeadKey::new(key);
        Self {
            commitment: key.commitment(),
            key,
            salt,
            expected_sequence: 0,
        }
    }

    /// Next sequence number this cipher will accept.
    #[must_use]
    pub fn expected_sequence(&self) -> u64 {
        self.expected_sequence
    }

    /// Authenticate and decrypt one frame.
    ///
    /// The expected sequence only advances on success; any error is
    /// terminal for the channel.
    ///
    /// # Errors
    ///
    /// - `CryptoError::SequenceMismatch` for replayed, skipped or reordered frames
    /// - `CryptoError::DecryptionFailed` for a bad tag
    pub fn open(&mut self, sequence: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sequence != self.expected_sequence {
            return Err(CryptoError::SequenceMismatch {
                expected: self.expected_sequence,
                actual: sequence,
            });
        }
        let nonce = Nonce::from_counter(sequence, &self.salt);
        let plaintext =
            self.key
                .decrypt(&nonce, ciphertext, &frame_aad(&self.commitment, sequence))?;
        self.expected_sequence += 1;
        Ok(plaintext)
    }
}
