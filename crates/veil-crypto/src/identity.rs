//! Node identities.
//!
//! A node is identified by an Ed25519 keypair. Its network identifier (node
//! ID) is the BLAKE3 hash of the public key under a domain tag, so the ID is
//! bound to the key that signs the node's handshakes.
//!
//! # Example
//!
//! ```
//! use veil_crypto::{generate_identity, load_identity};
//!
//! let identity = generate_identity().expect("entropy available");
//! let restored = load_identity(&identity.to_bytes()).expect("valid key material");
//! assert_eq!(identity.node_id(), restored.node_id());
//! ```

use crate::signatures::{Signature, SigningKey, VerifyingKey};
use crate::{CryptoError, ED25519_SECRET_KEY_SIZE, NODE_ID_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

const NODE_ID_DOMAIN: &[u8] = b"veil-node-id";

/// Derive the node ID for an Ed25519 public key.
#[must_use]
pub fn derive_node_id(public_key: &[u8; 32]) -> [u8; NODE_ID_SIZE] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(public_key);
    hasher.update(NODE_ID_DOMAIN);
    *hasher.finalize().as_bytes()
}

/// Generate a fresh identity from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the entropy source is unavailable.
pub fn generate_identity() -> Result<NodeIdentity, CryptoError> {
    let mut seed = crate::random::random_32()?;
    let identity = NodeIdentity::from_seed(&seed);
    seed.zeroize();
    Ok(identity)
}

/// Load an identity from its exported seed bytes.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyMaterial`] unless `bytes` is exactly
/// 32 bytes long.
pub fn load_identity(bytes: &[u8]) -> Result<NodeIdentity, CryptoError> {
    if bytes.len() != ED25519_SECRET_KEY_SIZE {
        return Err(CryptoError::InvalidKeyMaterial);
    }
    let mut seed = [0u8; ED25519_SECRET_KEY_SIZE];
    seed.copy_from_slice(bytes);
    let identity = NodeIdentity::from_seed(&seed);
    seed.zeroize();
    Ok(identity)
}

/// A node's long-term keypair and derived node ID.
///
/// The signing key is zeroized on drop and never serialized implicitly; use
/// [`NodeIdentity::to_bytes`] or [`crate::encrypted_identity`] for persistence.
pub struct NodeIdentity {
    signing_key: SigningKey,
    public: PublicIdentity,
}

impl NodeIdentity {
    fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_seed(seed);
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            public: PublicIdentity {
                node_id: derive_node_id(&public_key),
                public_key,
            },
            signing_key,
        }
    }

    /// The node ID.
    #[must_use]
    pub fn node_id(&self) -> &[u8; NODE_ID_SIZE] {
        &self.public.node_id
    }

    /// The Ed25519 public key.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public.public_key
    }

    /// The shareable half of this identity.
    #[must_use]
    pub fn public(&self) -> PublicIdentity {
        self.public
    }

    /// Sign with the long-term key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Export the 32-byte secret seed (for the storage collaborator).
    ///
    /// # Security
    ///
    /// The returned bytes are the private key. Zeroize them after use.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ED25519_SECRET_KEY_SIZE] {
        self.signing_key.to_seed()
    }
}

impl Clone for NodeIdentity {
    fn clone(&self) -> Self {
        let mut seed = self.signing_key.to_seed();
        let cloned = Self::from_seed(&seed);
        seed.zeroize();
        cloned
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &hex::encode(&self.public.node_id[..8]))
            .finish_non_exhaustive()
    }
}

/// Public part of an identity: node ID and Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Node ID (BLAKE3 of the public key)
    pub node_id: [u8; NODE_ID_SIZE],
    /// Ed25519 public key
    pub public_key: [u8; 32],
}

impl PublicIdentity {
    /// Build from a public key received over the wire, deriving the node ID.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the key is not a valid
    /// Ed25519 point.
    pub fn from_public_key(public_key: [u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(&public_key)?;
        Ok(Self {
            node_id: derive_node_id(&public_key),
            public_key,
        })
    }

    /// Verify a signature made by this identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] or
    /// [`CryptoError::InvalidPublicKey`] on failure.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        VerifyingKey::from_bytes(&self.public_key)?.verify(message, signature)
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", hex::encode(&self.node_id[..8]))
    }
}
