//! Request handlers.

use async_trait::async_trait;
use std::future::Future;
use veil_discovery::NodeId;

/// An incoming request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    /// Authenticated caller
    pub peer: NodeId,
    /// Method name
    pub method: String,
    /// Request arguments
    pub payload: Vec<u8>,
}

/// Application-level failure returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler error {code}: {message}")]
pub struct HandlerError {
    /// Application-defined code
    pub code: u32,
    /// Detail sent back to the caller
    pub message: String,
}

impl HandlerError {
    /// Create a handler error
    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Serves one RPC method.
///
/// Implemented for any `Fn(Request) -> impl Future<Output = Result<Vec<u8>, HandlerError>>`,
/// so closures work directly:
///
/// ```
/// use veil_core::rpc::{HandlerError, Request, RpcHandler};
///
/// fn assert_handler<H: RpcHandler>(_: H) {}
///
/// assert_handler(|req: Request| async move {
///     if req.payload.is_empty() {
///         return Err(HandlerError::new(1, "empty"));
///     }
///     Ok(req.payload)
/// });
/// ```
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one request.
    async fn handle(&self, request: Request) -> Result<Vec<u8>, HandlerError>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<Vec<u8>, HandlerError> {
        (self)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_closure_handler() {
        let handler: Arc<dyn RpcHandler> = Arc::new(|req: Request| async move {
            let mut out = b"echo:".to_vec();
            out.extend_from_slice(&req.payload);
            Ok::<_, HandlerError>(out)
        });
        let request = Request {
            peer: NodeId::random(),
            method: "echo".into(),
            payload: b"x".to_vec(),
        };
        assert_eq!(handler.handle(request).await.unwrap(), b"echo:x");
    }

    #[tokio::test]
    async fn test_handler_error() {
        let handler: Arc<dyn RpcHandler> =
            Arc::new(|_req: Request| async move { Err::<Vec<u8>, _>(HandlerError::new(7, "denied")) });
        let request = Request {
            peer: NodeId::random(),
            method: "guarded".into(),
            payload: Vec::new(),
        };
        assert_eq!(
            handler.handle(request).await.unwrap_err(),
            HandlerError::new(7, "denied")
        );
    }
}
