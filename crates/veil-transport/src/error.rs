//! Error types for links, transports and secure channels.

use crate::channel::CloseReason;
use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport or link is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Outbound connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A frame exceeded the configured maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Size of the offending frame
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Key exchange failed (verification, version, framing or timeout)
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors reported by an established [`SecureChannel`](crate::SecureChannel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// An inbound frame failed authentication or arrived out of sequence.
    /// The channel has been torn down.
    #[error("Channel corrupted")]
    Corrupted,

    /// The channel is closed
    #[error("Channel closed: {0}")]
    Closed(CloseReason),

    /// Payload does not fit in a single frame
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Largest payload that fits
        max: usize,
    },

    /// The stream identifier space for this channel is used up
    #[error("Stream identifiers exhausted")]
    StreamsExhausted,
}

impl ChannelError {
    /// Whether this error came from an integrity violation.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, ChannelError::Corrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::FrameTooLarge { size: 10, max: 5 };
        assert_eq!(err.to_string(), "Frame too large: 10 bytes (max 5)");

        let err = TransportError::HandshakeFailed("bad signature".into());
        assert_eq!(err.to_string(), "Handshake failed: bad signature");

        let err = ChannelError::Closed(CloseReason::Idle);
        assert_eq!(err.to_string(), "Channel closed: idle timeout");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err: TransportError = io_err.into();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn test_is_corruption() {
        assert!(ChannelError::Corrupted.is_corruption());
        assert!(!ChannelError::Closed(CloseReason::Remote).is_corruption());
    }
}
