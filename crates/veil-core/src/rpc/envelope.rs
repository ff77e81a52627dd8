//! RPC wire envelope.
//!
//! Every request and response travels as one bincode-encoded [`Envelope`]
//! on its own channel stream. The response reuses the request's call ID and
//! stream.

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// Call identifier, unique per originating node
pub type CallId = u64;

/// Request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Caller to callee
    Request,
    /// Callee to caller
    Response,
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Handler succeeded; payload is its output
    Ok,
    /// No handler registered for the method
    MethodNotFound,
    /// Handler failed with an application-defined code
    ApplicationError(u32),
    /// Request could not be decoded or had the wrong version
    BadRequest,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::MethodNotFound => write!(f, "method not found"),
            Status::ApplicationError(code) => write!(f, "application error {code}"),
            Status::BadRequest => write!(f, "bad request"),
        }
    }
}

/// One RPC message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version
    pub version: u8,
    /// Call this message belongs to
    pub call_id: CallId,
    /// Request or response
    pub direction: Direction,
    /// Method name (echoed in responses)
    pub method: String,
    /// Response status; `Ok` on requests
    pub status: Status,
    /// Request arguments, handler output, or UTF-8 error detail
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build a request
    #[must_use]
    pub fn request(call_id: CallId, method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            call_id,
            direction: Direction::Request,
            method: method.into(),
            status: Status::Ok,
            payload,
        }
    }

    /// Build a response to `request`
    #[must_use]
    pub fn response(request: &Envelope, status: Status, payload: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            call_id: request.call_id,
            direction: Direction::Response,
            method: request.method.clone(),
            status,
            payload,
        }
    }

    /// Build an error response carrying a text message
    #[must_use]
    pub fn error_response(request: &Envelope, status: Status, message: &str) -> Self {
        Self::response(request, status, message.as_bytes().to_vec())
    }

    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Serialization` on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Turn a response into the caller-facing result.
    ///
    /// # Errors
    ///
    /// Maps non-`Ok` statuses onto the matching [`NodeError`].
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self.status {
            Status::Ok => Ok(self.payload),
            Status::MethodNotFound => Err(NodeError::MethodNotFound(self.method)),
            Status::ApplicationError(code) => Err(NodeError::Application {
                code,
                message: String::from_utf8_lossy(&self.payload).into_owned(),
            }),
            Status::BadRequest => Err(NodeError::BadRequest(
                String::from_utf8_lossy(&self.payload).into_owned(),
            )),
        }
    }
}
