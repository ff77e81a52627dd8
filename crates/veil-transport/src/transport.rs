//! Transport trait abstraction.
//!
//! A `Transport` hands out [`RawLink`]s: outbound via `connect`, inbound via
//! `accept`. The node core is written against this trait so that it runs
//! unchanged over TCP sockets or over the in-process network used by tests.

use crate::error::TransportResult;
use crate::link::RawLink;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Async connection-oriented transport.
///
/// # Examples
///
/// ```no_run
/// use veil_transport::tcp::TcpTransport;
/// use veil_transport::transport::Transport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::bind("127.0.0.1:0".parse()?, 1 << 20).await?;
/// let mut link = transport.connect("127.0.0.1:40000".parse()?).await?;
/// link.send(b"frame".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to a remote address.
    ///
    /// # Errors
    /// Returns `TransportError::ConnectionFailed` if the peer cannot be reached,
    /// or `TransportError::Closed` after `close`.
    async fn connect(&self, addr: SocketAddr) -> TransportResult<RawLink>;

    /// Wait for the next inbound link.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the transport is closed.
    async fn accept(&self) -> TransportResult<RawLink>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting and release the listening resource.
    ///
    /// After calling this method, `connect` and `accept` return
    /// `TransportError::Closed`. Links already handed out stay usable.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Successful outbound connects
    pub links_connected: u64,
    /// Accepted inbound links
    pub links_accepted: u64,
    /// Failed outbound connects
    pub connect_failures: u64,
}

/// Lock-free counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    connected: AtomicU64,
    accepted: AtomicU64,
    connect_failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_connect(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            links_connected: self.connected.load(Ordering::Relaxed),
            links_accepted: self.accepted.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let counters = StatsCounters::default();
        assert_eq!(counters.snapshot(), TransportStats::default());

        counters.record_connect();
        counters.record_connect();
        counters.record_accept();
        counters.record_connect_failure();

        let stats = counters.snapshot();
        assert_eq!(stats.links_connected, 2);
        assert_eq!(stats.links_accepted, 1);
        assert_eq!(stats.connect_failures, 1);
    }
}
