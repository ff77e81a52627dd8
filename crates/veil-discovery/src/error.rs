//! Discovery errors.

use thiserror::Error;

/// Errors from routing, lookup and relay message handling
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Encoding a message failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Decoding a message failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A remote FIND_NODE query failed
    #[error("RPC failed: {0}")]
    RpcFailed(String),

    /// A remote query did not answer in time
    #[error("Query timed out")]
    Timeout,

    /// A routing snapshot could not be read or does not belong to this node
    #[error("Invalid routing snapshot: {0}")]
    InvalidSnapshot(String),
}
