//! Frame-level links.
//!
//! A [`RawLink`] is anything that can carry discrete frames in order between
//! two endpoints. It is the capability the handshake and the secure channel
//! are written against. Two variants exist:
//!
//! - [`LinkKind::Direct`]: a byte stream (TCP socket, in-memory duplex) with
//!   length-prefixed framing.
//! - [`LinkKind::Tunnel`]: frames carried as messages through a relay. The
//!   link side is handed to the channel; the [`TunnelEnd`] side is pumped by
//!   whoever talks to the relay.

use crate::error::{TransportError, TransportResult};
use crate::framing::{read_frame, write_frame};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Outbound half of a link.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send_frame(&mut self, frame: Vec<u8>) -> TransportResult<()>;

    /// Flush and close the outbound direction.
    async fn shutdown(&mut self) -> TransportResult<()>;
}

/// Inbound half of a link.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame. `Ok(None)` means the peer closed the link.
    async fn recv_frame(&mut self) -> TransportResult<Option<Vec<u8>>>;
}

/// How a link reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Direct byte stream
    Direct,
    /// Tunnel through a relaying peer
    Tunnel,
}

/// A bidirectional frame link, exclusively owned.
pub struct RawLink {
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
    kind: LinkKind,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for RawLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawLink")
            .field("kind", &self.kind)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl RawLink {
    /// Build a link from arbitrary halves.
    #[must_use]
    pub fn new(
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        kind: LinkKind,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            sink,
            source,
            kind,
            peer_addr,
        }
    }

    /// Wrap a byte stream with length-prefixed framing.
    pub fn from_stream<S>(stream: S, max_frame: usize, peer_addr: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(
            Box::new(StreamSink { writer, max_frame }),
            Box::new(StreamSource { reader, max_frame }),
            LinkKind::Direct,
            peer_addr,
        )
    }

    /// Create a tunnel link and the end that feeds it.
    ///
    /// Frames sent on the link appear on [`TunnelEnd::outbound`]; frames
    /// pushed into [`TunnelEnd::inbound`] are received by the link. Dropping
    /// the inbound sender ends the link's input.
    #[must_use]
    pub fn tunnel(capacity: usize) -> (Self, TunnelEnd) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let link = Self::new(
            Box::new(TunnelSink { tx: Some(out_tx) }),
            Box::new(TunnelSource { rx: in_rx }),
            LinkKind::Tunnel,
            None,
        );
        let end = TunnelEnd {
            outbound: out_rx,
            inbound: in_tx,
        };
        (link, end)
    }

    /// Link variant.
    #[must_use]
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// Remote socket address, when the link is direct.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Propagates the sink's error.
    pub async fn send(&mut self, frame: Vec<u8>) -> TransportResult<()> {
        self.sink.send_frame(frame).await
    }

    /// Receive one frame, `None` on orderly close.
    ///
    /// # Errors
    ///
    /// Propagates the source's error.
    pub async fn recv(&mut self) -> TransportResult<Option<Vec<u8>>> {
        self.source.recv_frame().await
    }

    /// Split into the owned halves.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

struct StreamSink<W> {
    writer: WriteHalf<W>,
    max_frame: usize,
}

#[async_trait]
impl<W> FrameSink for StreamSink<W>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> TransportResult<()> {
        write_frame(&mut self.writer, &frame, self.max_frame).await
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct StreamSource<R> {
    reader: ReadHalf<R>,
    max_frame: usize,
}

#[async_trait]
impl<R> FrameSource for StreamSource<R>
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<Vec<u8>>> {
        read_frame(&mut self.reader, self.max_frame).await
    }
}

struct TunnelSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for TunnelSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }
}

struct TunnelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for TunnelSource {
    async fn recv_frame(&mut self) -> TransportResult<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

/// The relay-facing end of a tunnel link.
#[derive(Debug)]
pub struct TunnelEnd {
    /// Frames the link wants delivered to the far side
    pub outbound: mpsc::Receiver<Vec<u8>>,
    /// Frames arriving from the far side
    pub inbound: mpsc::Sender<Vec<u8>>,
}
