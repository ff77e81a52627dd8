//! Passphrase-protected identity export.
//!
//! The identity seed is encrypted with `XChaCha20-Poly1305` under a key
//! derived from the passphrase with Argon2id. The header (format version, KDF
//! parameters, salt and the node ID in clear) is authenticated as associated
//! data, so none of it can be swapped without detection.
//!
//! ## Format
//!
//! ```text
//! [version: 1] [params: 6] [node_id: 32] [salt: 32] [nonce: 24] [ciphertext: 48]
//! ```
//!
//! ```
//! use veil_crypto::encrypted_identity::{EncryptedIdentity, KdfParams};
//! use veil_crypto::generate_identity;
//!
//! let identity = generate_identity().unwrap();
//! let sealed = EncryptedIdentity::seal(&identity, b"passphrase", KdfParams::low_cost()).unwrap();
//! let stored = sealed.to_bytes();
//!
//! let opened = EncryptedIdentity::from_bytes(&stored)
//!     .unwrap()
//!     .open(b"passphrase")
//!     .unwrap();
//! assert_eq!(opened.node_id(), identity.node_id());
//! ```

use crate::identity::{NodeIdentity, load_identity};
use crate::{CryptoError, NODE_ID_SIZE};
use argon2::{Algorithm, Argon2, ParamsBuilder, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

const FORMAT_VERSION: u8 = 1;
const PARAMS_SIZE: usize = 6;
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const SEED_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = 1 + PARAMS_SIZE + NODE_ID_SIZE + SALT_SIZE;
const ENCODED_SIZE: usize = HEADER_SIZE + NONCE_SIZE + SEED_SIZE + TAG_SIZE;

/// Argon2id cost parameters.
///
/// Defaults follow the OWASP password storage recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 65536, // 64 MiB
            iterations: 4,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and constrained devices.
    #[must_use]
    pub fn low_cost() -> Self {
        Self {
            memory_cost_kib: 4096,
            iterations: 2,
            parallelism: 1,
        }
    }

    fn validate(&self) -> Result<(), CryptoError> {
        if self.memory_cost_kib < 8 || self.memory_cost_kib >= 1 << 24 {
            return Err(CryptoError::InvalidParameter(
                "memory_cost_kib must be in 8..16777216".into(),
            ));
        }
        if self.iterations < 1 || self.iterations > u32::from(u16::MAX) {
            return Err(CryptoError::InvalidParameter(
                "iterations must be in 1..=65535".into(),
            ));
        }
        if self.parallelism < 1 || self.parallelism > 255 {
            return Err(CryptoError::InvalidParameter(
                "parallelism must be in 1..=255".into(),
            ));
        }
        Ok(())
    }

    fn encode(self) -> [u8; PARAMS_SIZE] {
        let mut bytes = [0u8; PARAMS_SIZE];
        bytes[0..3].copy_from_slice(&self.memory_cost_kib.to_le_bytes()[0..3]);
        bytes[3..5].copy_from_slice(&(self.iterations as u16).to_le_bytes());
        bytes[5] = self.parallelism as u8;
        bytes
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            memory_cost_kib: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            iterations: u32::from(u16::from_le_bytes([bytes[3], bytes[4]])),
            parallelism: u32::from(bytes[5]),
        }
    }

    fn derive_key(
        &self,
        passphrase: &[u8],
        salt: &[u8; SALT_SIZE],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        self.validate()?;
        let params = ParamsBuilder::new()
            .m_cost(self.memory_cost_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .build()
            .map_err(|e| CryptoError::InvalidParameter(format!("argon2 params: {e}")))?;

        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase, salt, &mut key[..])
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(key)
    }
}

/// An identity seed encrypted under a passphrase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedIdentity {
    params: KdfParams,
    node_id: [u8; NODE_ID_SIZE],
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl EncryptedIdentity {
    /// Encrypt `identity` under `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidParameter` for out-of-range KDF
    /// parameters, `CryptoError::RandomFailed` if salt or nonce cannot be
    /// drawn.
    pub fn seal(
        identity: &NodeIdentity,
        passphrase: &[u8],
        params: KdfParams,
    ) -> Result<Self, CryptoError> {
        params.validate()?;
        let salt = crate::random::random_32()?;
        let mut nonce = [0u8; NONCE_SIZE];
        crate::random::fill_random(&mut nonce)?;

        let mut sealed = Self {
            params,
            node_id: *identity.node_id(),
            salt,
            nonce,
            ciphertext: Vec::new(),
        };

        let key = params.derive_key(passphrase, &salt)?;
        let mut seed = identity.to_bytes();
        let result = XChaCha20Poly1305::new((&*key).into()).encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &seed,
                aad: &sealed.header(),
            },
        );
        seed.zeroize();

        sealed.ciphertext = result.map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(sealed)
    }

    /// Decrypt and load the identity.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` for a wrong passphrase or
    /// tampered data, `CryptoError::InvalidKeyMaterial` if the decrypted key
    /// does not match the stored node ID.
    pub fn open(&self, passphrase: &[u8]) -> Result<NodeIdentity, CryptoError> {
        let key = self.params.derive_key(passphrase, &self.salt)?;
        let seed = Zeroizing::new(
            XChaCha20Poly1305::new((&*key).into())
                .decrypt(
                    XNonce::from_slice(&self.nonce),
                    Payload {
                        msg: &self.ciphertext,
                        aad: &self.header(),
                    },
                )
                .map_err(|_| CryptoError::DecryptionFailed)?,
        );

        let identity = load_identity(&seed)?;
        if *identity.node_id() != self.node_id {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        Ok(identity)
    }

    /// Node ID of the sealed identity, readable without the passphrase.
    #[must_use]
    pub fn node_id(&self) -> &[u8; NODE_ID_SIZE] {
        &self.node_id
    }

    /// KDF parameters used for this export.
    #[must_use]
    pub fn params(&self) -> KdfParams {
        self.params
    }

    fn header(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..1 + PARAMS_SIZE].copy_from_slice(&self.params.encode());
        header[1 + PARAMS_SIZE..1 + PARAMS_SIZE + NODE_ID_SIZE].copy_from_slice(&self.node_id);
        header[1 + PARAMS_SIZE + NODE_ID_SIZE..].copy_from_slice(&self.salt);
        header
    }

    /// Serialize for storage.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENCODED_SIZE);
        bytes.extend_from_slice(&self.header());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse a stored export.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyMaterial` for a wrong length and
    /// `CryptoError::InvalidParameter` for an unknown format version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ENCODED_SIZE {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(CryptoError::InvalidParameter(format!(
                "unsupported format version: {}",
                bytes[0]
            )));
        }

        let mut offset = 1;
        let params = KdfParams::decode(&bytes[offset..offset + PARAMS_SIZE]);
        offset += PARAMS_SIZE;
        let mut node_id = [0u8; NODE_ID_SIZE];
        node_id.copy_from_slice(&bytes[offset..offset + NODE_ID_SIZE]);
        offset += NODE_ID_SIZE;
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[offset..offset + SALT_SIZE]);
        offset += SALT_SIZE;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[offset..offset + NONCE_SIZE]);
        offset += NONCE_SIZE;

        Ok(Self {
            params,
            node_id,
            salt,
            nonce,
            ciphertext: bytes[offset..].to_vec(),
        })
    }
}
