//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Handshake failed (verification mismatch, version mismatch, malformed message)
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),

    /// Operation not valid in the current handshake state
    #[error("invalid state for operation")]
    InvalidState,

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Sequence counter exhausted
    #[error("sequence counter exhausted, channel must be re-established")]
    NonceOverflow,

    /// Frame sequence number did not match the next expected value
    #[error("unexpected sequence number: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// Next expected sequence number
        expected: u64,
        /// Sequence number carried by the frame
        actual: u64,
    },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,
}

impl CryptoError {
    /// Returns true if this error means the peer violated channel integrity.
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::DecryptionFailed | CryptoError::SequenceMismatch { .. }
        )
    }
}
