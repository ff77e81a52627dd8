//! # VEIL Transport
//!
//! Secure channel layer for the VEIL network core.
//!
//! This crate provides:
//! - Length-prefixed frame codec over byte streams
//! - [`RawLink`]: a frame-level link with direct-stream and relay-tunnel variants
//! - The [`Transport`] trait with TCP and in-memory implementations
//! - [`perform_handshake`]: drives the authenticated key exchange over a link
//! - [`SecureChannel`]: encrypted, sequence-checked, multiplexed message bus

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod link;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use channel::{ChannelState, CloseReason, SecureChannel, StreamId};
pub use error::{ChannelError, TransportError, TransportResult};
pub use handshake::perform_handshake;
pub use link::{FrameSink, FrameSource, LinkKind, RawLink, TunnelEnd};
pub use transport::{Transport, TransportStats};
pub use veil_crypto::handshake::Role;

use std::time::Duration;

/// Default maximum frame size on the wire (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Secure channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Upper bound for the whole handshake exchange
    pub handshake_timeout: Duration,
    /// Channel closes after this long without a frame in either direction
    pub idle_timeout: Duration,
    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,
    /// Capacity of the inbound message queue
    pub inbound_queue: usize,
    /// Largest encrypted frame accepted or produced
    pub max_frame_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(180),
            outbound_queue: 256,
            inbound_queue: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ChannelConfig {
    /// Largest application payload that fits in one frame.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.max_frame_size
            .saturating_sub(framing::SEQUENCE_SIZE + veil_crypto::aead::TAG_SIZE)
            .saturating_sub(framing::INNER_HEADER_SIZE)
    }
}
