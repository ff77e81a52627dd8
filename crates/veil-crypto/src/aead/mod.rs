//! `XChaCha20-Poly1305` AEAD encryption.
//!
//! - 256-bit keys
//! - 192-bit nonces built from a 64-bit counter plus a per-session salt
//! - 128-bit authentication tags
//! - Key commitment prepended to the associated data
//!
//! ## Module Organization
//!
//! - this module: core AEAD types ([`Nonce`], [`AeadKey`])
//! - [`session`]: directional frame ciphers with strict sequence checks
//!
//! ## Usage
//!
//! ```
//! use veil_crypto::aead::{AeadKey, Nonce};
//!
//! let key = AeadKey::new([7u8; 32]);
//! let nonce = Nonce::from_counter(0, &[0u8; 16]);
//!
//! let ciphertext = key.encrypt(&nonce, b"secret", b"aad").unwrap();
//! let plaintext = key.decrypt(&nonce, &ciphertext, b"aad").unwrap();
//! assert_eq!(plaintext, b"secret");
//! ```

pub mod session;

pub use session::{RecvCipher, SendCipher, split_session};

use crate::CryptoError;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the key commitment carried in the associated data.
pub const COMMITMENT_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a counter value.
    ///
    /// The counter occupies the first 8 bytes (little-endian), the salt the
    /// remaining 16.
    #[must_use]
    pub fn from_counter(counter: u64, salt: &[u8; 16]) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
        bytes[8..].copy_from_slice(salt);
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes), zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Commitment to this key, safe to reveal.
    ///
    /// Binding the commitment into the AAD makes a ciphertext valid under
    /// exactly one key.
    #[must_use]
    pub fn commitment(&self) -> [u8; COMMITMENT_SIZE] {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(b"veil-key-commitment");
        *hasher.finalize().as_bytes()
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with the 16-byte tag appended.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        XChaCha20Poly1305::new((&self.0).into())
            .encrypt(
                nonce.as_generic(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext (tag included) with associated data.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        XChaCha20Poly1305::new((&self.0).into())
            .decrypt(
                nonce.as_generic(),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = AeadKey::new([0x42; 32]);
        let nonce = Nonce::from_counter(5, &[9u8; 16]);
        let ct = key.encrypt(&nonce, b"hello", b"aad").unwrap();
        assert_eq!(ct.len(), 5 + TAG_SIZE);
        assert_eq!(key.decrypt(&nonce, &ct, b"aad").unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_aad_or_nonce_fails() {
        let key = AeadKey::new([0x42; 32]);
        let nonce = Nonce::from_counter(5, &[9u8; 16]);
        let ct = key.encrypt(&nonce, b"hello", b"aad").unwrap();

        assert_eq!(
            key.decrypt(&nonce, &ct, b"aaD"),
            Err(CryptoError::DecryptionFailed)
        );
        assert_eq!(
            key.decrypt(&Nonce::from_counter(6, &[9u8; 16]), &ct, b"aad"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = AeadKey::new([1; 32]);
        let nonce = Nonce::from_counter(0, &[0u8; 16]);
        assert!(key.decrypt(&nonce, &[0u8; TAG_SIZE - 1], b"").is_err());
    }

    #[test]
    fn test_commitment_differs_per_key() {
        assert_ne!(
            AeadKey::new([1; 32]).commitment(),
            AeadKey::new([2; 32]).commitment()
        );
    }

    #[test]
    fn test_from_slice_length() {
        assert_eq!(
            AeadKey::from_slice(&[0u8; 31]).err(),
            Some(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        );
        assert!(AeadKey::from_slice(&[0u8; 32]).is_ok());
    }
}
