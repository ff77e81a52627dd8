//! RPC dispatch primitives.
//!
//! - [`Envelope`]: the bincode wire shape of requests and responses
//! - [`PendingCalls`]: outstanding calls keyed by call ID
//! - [`RpcHandler`]: the server-side handler trait
//!
//! The node wires these together; see [`crate::Node::call`] and
//! [`crate::Node::serve`].

pub mod envelope;
pub mod handler;
pub mod pending;

pub use envelope::{CallId, Direction, ENVELOPE_VERSION, Envelope, Status};
pub use handler::{HandlerError, Request, RpcHandler};
pub use pending::{CallResult, PendingCall, PendingCalls};
