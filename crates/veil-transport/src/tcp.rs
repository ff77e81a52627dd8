//! TCP transport.
//!
//! Listener sockets are created through `socket2` so that address reuse and
//! the backlog can be set before binding; accepted and dialed streams have
//! Nagle disabled since frames are small and latency-sensitive.

use crate::error::{TransportError, TransportResult};
use crate::link::RawLink;
use crate::transport::{StatsCounters, Transport, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

const LISTEN_BACKLOG: i32 = 1024;

/// Default timeout for outbound connects
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport bound to a local address.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_frame: usize,
    connect_timeout: Duration,
    closed: AtomicBool,
    shutdown: Notify,
    stats: StatsCounters,
}

impl TcpTransport {
    /// Bind a listener. Use port 0 for automatic port selection.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
    pub async fn bind(addr: SocketAddr, max_frame: usize) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = listener.local_addr()?;

        tracing::debug!(%local_addr, "TCP transport bound");

        Ok(Self {
            listener,
            local_addr,
            max_frame,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            stats: StatsCounters::default(),
        })
    }

    /// Override the outbound connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn wrap(&self, stream: TcpStream, peer: SocketAddr) -> RawLink {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
        RawLink::from_stream(stream, self.max_frame, Some(peer))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<RawLink> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.record_connect_failure();
                return Err(TransportError::ConnectionFailed(format!("{addr}: {e}")));
            }
            Err(_) => {
                self.stats.record_connect_failure();
                return Err(TransportError::ConnectionFailed(format!(
                    "{addr}: connect timed out"
                )));
            }
        };

        self.stats.record_connect();
        Ok(self.wrap(stream, addr))
    }

    async fn accept(&self) -> TransportResult<RawLink> {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            result = self.listener.accept() => {
                let (stream, peer) = result?;
                self.stats.record_accept();
                tracing::trace!(%peer, "Accepted TCP connection");
                Ok(self.wrap(stream, peer))
            }
            () = &mut notified => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_local() -> TcpTransport {
        TcpTransport::bind("127.0.0.1:0".parse().unwrap(), 64 * 1024)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let transport = bind_local().await;
        assert_ne!(transport.local_addr().unwrap().port(), 0);
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_connect_accept_exchange() {
        let server = bind_local().await;
        let client = bind_local().await;
        let addr = server.local_addr().unwrap();

        let (dialed, accepted) = tokio::join!(client.connect(addr), server.accept());
        let mut dialed = dialed.unwrap();
        let mut accepted = accepted.unwrap();

        dialed.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap().unwrap(), b"ping");
        accepted.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(dialed.recv().await.unwrap().unwrap(), b"pong");

        assert_eq!(client.stats().links_connected, 1);
        assert_eq!(server.stats().links_accepted, 1);
    }

    #[tokio::test]
    async fn test_close_wakes_accept() {
        let server = std::sync::Arc::new(bind_local().await);
        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await.unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(
            server.connect("127.0.0.1:1".parse().unwrap()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let closed_port = {
            let probe = bind_local().await;
            probe.local_addr().unwrap()
        };
        let client = bind_local().await;
        let result = client.connect(closed_port).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert_eq!(client.stats().connect_failures, 1);
    }
}
