//! # Relay Fallback
//!
//! When two nodes cannot reach each other directly, a third node both can
//! reach forwards traffic between them. The two endpoints run their
//! handshake end to end through the relay, so the relay only ever sees
//! sealed frames.
//!
//! ## Architecture
//!
//! ```text
//!       ┌─────────────┐   Open/Data   ┌─────────────┐  Incoming/Data ┌─────────────┐
//!       │   Node A    │ ─────────────▶│   Relay B   │ ──────────────▶│   Node C    │
//!       │ (initiator) │◀───────────── │ (no keys)   │◀────────────── │ (responder) │
//!       └─────────────┘     Data      └─────────────┘      Data      └─────────────┘
//! ```
//!
//! Control messages travel on stream 0 of the existing direct channels
//! A↔B and B↔C. Each leg has its own tunnel ID.
//!
//! ## Example
//!
//! ```rust
//! use veil_discovery::relay::{RelayCandidate, RelaySelector};
//! use veil_discovery::NodeId;
//! use std::time::Duration;
//!
//! let near = NodeId::random();
//! let far = NodeId::random();
//!
//! let mut selector = RelaySelector::new();
//! selector.add_candidate(RelayCandidate::new(far).with_latency(Duration::from_millis(90)));
//! selector.add_candidate(RelayCandidate::new(near).with_latency(Duration::from_millis(15)));
//!
//! assert_eq!(selector.select_best(&[]).map(|c| c.id), Some(near));
//! ```

pub mod protocol;
pub mod selection;

pub use protocol::{RelayErrorCode, RelayMessage, TunnelId};
pub use selection::{RelayCandidate, RelaySelector};
