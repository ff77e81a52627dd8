//! Relay control messages.

use crate::dht::NodeId;
use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one tunnel on one channel leg. Chosen by the side that opens
/// the leg.
pub type TunnelId = u64;

/// Messages exchanged on the control stream of a direct channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayMessage {
    /// Ask the relay to open a tunnel to `dest`
    Open {
        /// Tunnel ID on the initiator's leg
        tunnel: TunnelId,
        /// Destination node
        dest: NodeId,
    },

    /// Relay announces a tunnel from `src` to the destination
    Incoming {
        /// Tunnel ID on the destination's leg
        tunnel: TunnelId,
        /// Node that opened the tunnel
        src: NodeId,
    },

    /// Opaque tunnel bytes (a sealed frame of the inner channel)
    Data {
        /// Tunnel ID on the receiving leg
        tunnel: TunnelId,
        /// Frame body
        bytes: Vec<u8>,
    },

    /// Tunnel torn down by either end
    Close {
        /// Tunnel ID on the receiving leg
        tunnel: TunnelId,
    },

    /// Tunnel could not be opened or was dropped by the relay
    Error {
        /// Tunnel ID on the receiving leg
        tunnel: TunnelId,
        /// Reason
        code: RelayErrorCode,
    },
}

/// Relay error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorCode {
    /// The relay has no live channel to the destination
    DestinationUnreachable = 1,
    /// The relay does not forward traffic
    RelayDisabled = 2,
    /// The relay is at its tunnel limit
    TooManyTunnels = 3,
    /// The tunnel ID is not known on this leg
    UnknownTunnel = 4,
    /// The destination refused the tunnel
    Refused = 5,
}

impl RelayMessage {
    /// Serialize message to bytes
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DiscoveryError> {
        bincode::serialize(self).map_err(|e| DiscoveryError::Serialization(e.to_string()))
    }

    /// Deserialize message from bytes
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::Deserialization` on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        bincode::deserialize(bytes).map_err(|e| DiscoveryError::Deserialization(e.to_string()))
    }

    /// Tunnel the message refers to
    #[must_use]
    pub fn tunnel(&self) -> TunnelId {
        match self {
            RelayMessage::Open { tunnel, .. }
            | RelayMessage::Incoming { tunnel, .. }
            | RelayMessage::Data { tunnel, .. }
            | RelayMessage::Close { tunnel }
            | RelayMessage::Error { tunnel, .. } => *tunnel,
        }
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::Open { .. } => "Open",
            RelayMessage::Incoming { .. } => "Incoming",
            RelayMessage::Data { .. } => "Data",
            RelayMessage::Close { .. } => "Close",
            RelayMessage::Error { .. } => "Error",
        }
    }
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RelayErrorCode::DestinationUnreachable => "destination unreachable",
            RelayErrorCode::RelayDisabled => "relaying disabled",
            RelayErrorCode::TooManyTunnels => "too many tunnels",
            RelayErrorCode::UnknownTunnel => "unknown tunnel",
            RelayErrorCode::Refused => "refused by destination",
        };
        f.write_str(text)
    }
}
