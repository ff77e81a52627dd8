//! Node identifier and distance metric.
//!
//! A [`NodeId`] is the 256-bit coordinate of a node in the DHT. It is derived
//! from the node's Ed25519 public key, so a peer cannot choose where it
//! lands in the key space without a matching key pair.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 256-bit node identifier
///
/// The XOR metric is used for distance calculation, which provides
/// the symmetry and triangle inequality that Kademlia routing relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Number of bits in a NodeId
    pub const BITS: usize = 256;

    /// Generate a random NodeId
    ///
    /// # Examples
    ///
    /// ```
    /// use veil_discovery::dht::NodeId;
    ///
    /// let id = NodeId::random();
    /// assert_eq!(id.as_bytes().len(), 32);
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the NodeId of an Ed25519 public key.
    ///
    /// Matches the identity layer's derivation, so a channel's authenticated
    /// remote identity maps directly to its routing table key.
    #[must_use]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(veil_crypto::derive_node_id(public_key))
    }

    /// XOR distance to another NodeId
    ///
    /// - d(x, x) = 0
    /// - d(x, y) = d(y, x)
    /// - d(x, z) = d(x, y) ⊕ d(y, z), hence d(x, z) <= d(x, y) + d(y, z)
    ///
    /// # Examples
    ///
    /// ```
    /// use veil_discovery::dht::NodeId;
    ///
    /// let id1 = NodeId::from_bytes([1u8; 32]);
    /// let id2 = NodeId::from_bytes([2u8; 32]);
    /// assert_eq!(id1.distance(&id2).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Count leading zero bits (0-256).
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count.min(Self::BITS)
    }

    /// Length of the common bit prefix with `other` (256 when equal).
    #[must_use]
    pub fn shared_prefix_len(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Bucket this ID falls into relative to `local_id`.
    ///
    /// The bucket index is the shared prefix length: bucket 0 holds the half
    /// of the key space farthest from the local node, bucket 255 the single
    /// closest ID. Returns `None` if the IDs are identical.
    ///
    /// # Examples
    ///
    /// ```
    /// use veil_discovery::dht::NodeId;
    ///
    /// let local = NodeId::from_bytes([0u8; 32]);
    /// let mut remote = [0u8; 32];
    /// remote[0] = 0b1000_0000;
    /// assert_eq!(NodeId::from_bytes(remote).bucket_index(&local), Some(0));
    /// ```
    #[must_use]
    pub fn bucket_index(&self, local_id: &NodeId) -> Option<usize> {
        let prefix = self.shared_prefix_len(local_id);
        (prefix < Self::BITS).then_some(prefix)
    }

    /// A random ID that lands in `bucket` relative to `self`.
    ///
    /// Shares exactly `bucket` leading bits with `self`; the next bit is
    /// flipped and the rest are random. Indices past 255 are clamped.
    #[must_use]
    pub fn random_in_bucket(&self, bucket: usize) -> NodeId {
        let bucket = bucket.min(Self::BITS - 1);
        let mut distance = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut distance);

        let byte_idx = bucket / 8;
        let target_bit = 0x80u8 >> (bucket % 8);
        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

        self.distance(&NodeId(distance))
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a NodeId from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Big-endian byte order, so comparing two distances compares them as
/// 256-bit integers.
impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
