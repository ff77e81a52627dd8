//! In-process transport.
//!
//! A [`MemoryNetwork`] is a registry of listening addresses; every
//! [`MemoryTransport`] bound on it can dial every other one through
//! `tokio::io::duplex` pipes. Pairs of addresses can be partitioned to model
//! peers that cannot reach each other directly.

use crate::error::{TransportError, TransportResult};
use crate::link::RawLink;
use crate::transport::{StatsCounters, Transport, TransportStats};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PIPE_BUFFER: usize = 256 * 1024;
const ACCEPT_BACKLOG: usize = 64;
const FIRST_EPHEMERAL_PORT: u16 = 40000;

type Incoming = (DuplexStream, SocketAddr);

#[derive(Default)]
struct Registry {
    listeners: HashMap<SocketAddr, mpsc::Sender<Incoming>>,
    partitions: HashSet<(SocketAddr, SocketAddr)>,
}

/// Shared in-process network.
#[derive(Clone)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
    next_port: Arc<AtomicU16>,
    max_frame: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_port: Arc::new(AtomicU16::new(FIRST_EPHEMERAL_PORT)),
            max_frame,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves the maps consistent; keep going.
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Bind a transport. Port 0 picks a free port on 127.0.0.1.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address is already taken.
    pub fn bind(&self, addr: SocketAddr) -> TransportResult<MemoryTransport> {
        let addr = if addr.port() == 0 {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
        } else {
            addr
        };

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        {
            let mut registry = self.registry();
            if registry.listeners.contains_key(&addr) {
                return Err(TransportError::BindFailed(format!("{addr} already in use")));
            }
            registry.listeners.insert(addr, tx);
        }

        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        })
    }

    /// Bind on an automatically chosen address.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the port space is exhausted.
    pub fn bind_any(&self) -> TransportResult<MemoryTransport> {
        self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    /// Make `a` and `b` unable to dial each other.
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        let mut registry = self.registry();
        registry.partitions.insert((a, b));
        registry.partitions.insert((b, a));
    }

    /// Undo [`partition`](Self::partition).
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        let mut registry = self.registry();
        registry.partitions.remove(&(a, b));
        registry.partitions.remove(&(b, a));
    }

    fn route(&self, from: SocketAddr, to: SocketAddr) -> TransportResult<mpsc::Sender<Incoming>> {
        let registry = self.registry();
        if registry.partitions.contains(&(from, to)) {
            return Err(TransportError::ConnectionFailed(format!(
                "{to}: network unreachable"
            )));
        }
        registry
            .listeners
            .get(&to)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("{to}: connection refused")))
    }

    fn unregister(&self, addr: SocketAddr) {
        self.registry().listeners.remove(&addr);
    }
}

/// Transport endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Incoming>>,
    closed: AtomicBool,
    stats: StatsCounters,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, addr: SocketAddr) -> TransportResult<RawLink> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let listener = match self.network.route(self.addr, addr) {
            Ok(listener) => listener,
            Err(e) => {
                self.stats.record_connect_failure();
                return Err(e);
            }
        };

        let (local, remote) = tokio::io::duplex(PIPE_BUFFER);
        if listener.send((remote, self.addr)).await.is_err() {
            self.stats.record_connect_failure();
            return Err(TransportError::ConnectionFailed(format!(
                "{addr}: connection refused"
            )));
        }

        self.stats.record_connect();
        Ok(RawLink::from_stream(local, self.network.max_frame, Some(addr)))
    }

    async fn accept(&self) -> TransportResult<RawLink> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((stream, peer)) => {
                self.stats.record_accept();
                Ok(RawLink::from_stream(stream, self.network.max_frame, Some(peer)))
            }
            None => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the registered sender ends any pending accept.
        self.network.unregister(self.addr);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unregister(self.addr);
    }
}
