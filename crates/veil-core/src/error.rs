//! Error types for the node core.
//!
//! [`NodeError`] is the internal taxonomy used throughout the crate. What an
//! application sees from a remote call is the narrower [`CallError`]: a call
//! either succeeds or fails in exactly one of three ways, and no
//! cryptographic or framing detail crosses that boundary.
//!
//! # Error Categories
//!
//! - **Transient**: network-level failures that may succeed later (timeouts,
//!   unreachable peers, lost channels)
//! - **Permanent**: failures that will not succeed without intervention
//!   (invalid configuration, integrity violations, unknown methods)
//!
//! # Example
//!
//! ```
//! use veil_core::{CallError, NodeError};
//!
//! let err = NodeError::timeout("call deadline");
//! assert!(err.is_transient());
//! assert_eq!(CallError::from(err), CallError::Timeout);
//! ```

use crate::rpc::Status;
use std::borrow::Cow;
use thiserror::Error;
use veil_discovery::{DiscoveryError, NodeId};
use veil_transport::{ChannelError, TransportError};

/// Errors that can occur in node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Cryptographic Errors ============
    /// Key generation, parsing or signature failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Authenticated key exchange failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(Cow<'static, str>),

    /// An authenticated channel saw a bad tag or out-of-sequence frame
    #[error("Channel corrupted (peer {0})")]
    ChannelCorrupted(NodeId),

    // ============ Reachability Errors ============
    /// No direct or relayed route to the peer
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(Cow<'static, str>),

    /// The channel carrying a call closed before the response arrived
    #[error("Channel to {0} lost")]
    ChannelLost(NodeId),

    /// Iterative lookup hit its round cap without locating the target
    #[error("Routing exhausted looking for {0}")]
    RoutingExhausted(NodeId),

    // ============ Call Errors ============
    /// The remote node has no handler for the method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// The remote handler returned an error
    #[error("Application error {code}: {message}")]
    Application {
        /// Handler-defined error code
        code: u32,
        /// Handler-supplied message
        message: String,
    },

    /// The remote node could not decode the request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// The caller cancelled the operation
    #[error("Cancelled")]
    Cancelled,

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the node's current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Encoding & I/O Errors ============
    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    ///
    /// Transient errors include:
    /// - Timeouts
    /// - Unreachable peers and lost channels
    /// - Exhausted lookups (the network may have changed)
    /// - I/O failures
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_)
                | NodeError::PeerUnreachable(_)
                | NodeError::ChannelLost(_)
                | NodeError::RoutingExhausted(_)
                | NodeError::Io(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    ///
    /// Permanent errors include:
    /// - Invalid configuration
    /// - Cryptographic and integrity failures
    /// - Unknown methods and malformed requests
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_)
                | NodeError::Crypto(_)
                | NodeError::HandshakeFailed(_)
                | NodeError::ChannelCorrupted(_)
                | NodeError::MethodNotFound(_)
                | NodeError::BadRequest(_)
                | NodeError::InvalidState(_)
        )
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        NodeError::HandshakeFailed(Cow::Borrowed(context))
    }

    /// Create an unreachable error with static context (zero allocation)
    #[must_use]
    pub const fn unreachable(context: &'static str) -> Self {
        NodeError::PeerUnreachable(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a serialization error with static context (zero allocation)
    #[must_use]
    pub const fn serialization(context: &'static str) -> Self {
        NodeError::Serialization(Cow::Borrowed(context))
    }

    /// Map a channel failure for the channel to `peer`.
    #[must_use]
    pub fn from_channel(peer: NodeId, err: ChannelError) -> Self {
        match err {
            ChannelError::Corrupted => NodeError::ChannelCorrupted(peer),
            ChannelError::Closed(_) => NodeError::ChannelLost(peer),
            ChannelError::PayloadTooLarge { size, max } => NodeError::Serialization(
                format!("payload of {size} bytes exceeds frame limit {max}").into(),
            ),
            ChannelError::StreamsExhausted => NodeError::ChannelLost(peer),
        }
    }
}

impl From<veil_crypto::CryptoError> for NodeError {
    fn from(err: veil_crypto::CryptoError) -> Self {
        NodeError::Crypto(err.to_string())
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::HandshakeFailed(reason) => NodeError::HandshakeFailed(reason.into()),
            TransportError::Timeout => NodeError::timeout("transport"),
            TransportError::InvalidConfig(reason) => NodeError::InvalidConfig(reason.into()),
            TransportError::Io(e) => NodeError::Io(e.to_string()),
            other => NodeError::PeerUnreachable(other.to_string().into()),
        }
    }
}

impl From<DiscoveryError> for NodeError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Timeout => NodeError::timeout("discovery query"),
            DiscoveryError::Serialization(e) | DiscoveryError::Deserialization(e) => {
                NodeError::Serialization(e.into())
            }
            DiscoveryError::InvalidSnapshot(e) => NodeError::InvalidConfig(e.into()),
            DiscoveryError::RpcFailed(e) => NodeError::PeerUnreachable(e.into()),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<bincode::Error> for NodeError {
    fn from(err: bincode::Error) -> Self {
        NodeError::Serialization(err.to_string().into())
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Outcome of a failed remote call, as seen by application code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The remote side answered with a non-success status
    /// (including [`Status::MethodNotFound`])
    #[error("Remote returned {status}: {message}")]
    Application {
        /// Response status
        status: Status,
        /// Detail supplied by the remote side
        message: String,
    },

    /// No response before the deadline
    #[error("Call timed out")]
    Timeout,

    /// No usable route to the peer, or the route failed mid-call
    #[error("Peer unreachable: {reason}")]
    Unreachable {
        /// Human-readable reason
        reason: String,
    },
}

impl CallError {
    /// Whether the remote reported an unknown method.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(
            self,
            CallError::Application {
                status: Status::MethodNotFound,
                ..
            }
        )
    }
}

impl From<NodeError> for CallError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::MethodNotFound(method) => CallError::Application {
                status: Status::MethodNotFound,
                message: method,
            },
            NodeError::Application { code, message } => CallError::Application {
                status: Status::ApplicationError(code),
                message,
            },
            NodeError::BadRequest(message) => CallError::Application {
                status: Status::BadRequest,
                message,
            },
            NodeError::Timeout(_) => CallError::Timeout,
            // Corruption and handshake detail stays internal.
            NodeError::ChannelCorrupted(_) => CallError::Unreachable {
                reason: "channel failed integrity check".into(),
            },
            NodeError::HandshakeFailed(_) | NodeError::Crypto(_) => CallError::Unreachable {
                reason: "could not authenticate peer".into(),
            },
            other => CallError::Unreachable {
                reason: other.to_string(),
            },
        }
    }
}
