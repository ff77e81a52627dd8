//! Secure channel.
//!
//! A [`SecureChannel`] owns a [`RawLink`] after a successful handshake and
//! turns it into an encrypted, authenticated, multiplexed message bus.
//!
//! Each channel runs two tasks:
//!
//! - the **writer** drains a bounded outbound queue, seals each frame with the
//!   next sequence number and writes it; it also enforces the idle timeout;
//! - the **reader** authenticates inbound frames in strict sequence order and
//!   pushes data frames onto the inbound queue.
//!
//! Both queues are FIFO, so order within a stream is preserved. Any integrity
//! failure moves the channel to [`ChannelState::Corrupted`]; both tasks exit,
//! the link is dropped and the ciphers are zeroized with it.

use crate::ChannelConfig;
use crate::error::ChannelError;
use crate::framing::{FrameType, InnerFrame, decode_sealed, encode_sealed};
use crate::link::{FrameSink, FrameSource, LinkKind, RawLink};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use veil_crypto::PublicIdentity;
use veil_crypto::aead::{RecvCipher, SendCipher, split_session};
use veil_crypto::handshake::{HandshakeOutcome, Role};

/// Stream identifier within a channel
pub type StreamId = u32;

/// Stream reserved for channel-level control traffic (relay messages).
pub const CONTROL_STREAM: StreamId = 0;

/// Why a channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side
    Local,
    /// Peer sent an orderly close
    Remote,
    /// No traffic within the idle timeout
    Idle,
    /// Underlying link ended or failed
    LinkLost,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote => write!(f, "closed by peer"),
            CloseReason::Idle => write!(f, "idle timeout"),
            CloseReason::LinkLost => write!(f, "link lost"),
        }
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Usable
    Open,
    /// Closed without an integrity failure
    Closed(CloseReason),
    /// Torn down after an integrity failure
    Corrupted,
}

impl ChannelState {
    /// Whether the channel still carries traffic.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    fn as_error(self) -> ChannelError {
        match self {
            ChannelState::Corrupted => ChannelError::Corrupted,
            ChannelState::Closed(reason) => ChannelError::Closed(reason),
            ChannelState::Open => ChannelError::Closed(CloseReason::LinkLost),
        }
    }
}

enum Outbound {
    Frame(InnerFrame),
    Close,
}

struct Shared {
    remote: PublicIdentity,
    role: Role,
    channel_id: [u8; 8],
    link_kind: LinkKind,
    peer_addr: Option<SocketAddr>,
    next_stream: AtomicU32,
    state: watch::Sender<ChannelState>,
    epoch: Instant,
    last_activity_ms: AtomicU64,
    max_payload: usize,
}

impl Shared {
    fn peer(&self) -> String {
        hex::encode(&self.remote.node_id[..8])
    }

    fn touch(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Leave the open state. Only the first transition sticks.
    fn transition(&self, next: ChannelState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            match next {
                ChannelState::Corrupted => tracing::warn!(
                    peer = %self.peer(),
                    "Integrity failure, secure channel torn down"
                ),
                ChannelState::Closed(reason) => tracing::info!(
                    peer = %self.peer(),
                    %reason,
                    "Secure channel closed"
                ),
                ChannelState::Open => {}
            }
        }
        changed
    }
}

/// An authenticated, encrypted, multiplexed channel to one peer.
pub struct SecureChannel {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    inbound: Mutex<mpsc::Receiver<(StreamId, Vec<u8>)>>,
    state_rx: watch::Receiver<ChannelState>,
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer", &self.shared.peer())
            .field("channel_id", &hex::encode(self.shared.channel_id))
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Key a channel from a completed handshake and start its I/O tasks.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn from_handshake(
        link: RawLink,
        outcome: HandshakeOutcome,
        role: Role,
        config: &ChannelConfig,
    ) -> Self {
        let HandshakeOutcome { keys, remote, .. } = outcome;
        let channel_id = keys.derive_channel_id();
        let (send_cipher, recv_cipher) = split_session(&keys);
        drop(keys);

        let link_kind = link.kind();
        let peer_addr = link.peer_addr();
        let (sink, source) = link.into_parts();

        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (in_tx, in_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (state_tx, state_rx) = watch::channel(ChannelState::Open);

        let first_stream = match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        };

        let shared = Arc::new(Shared {
            remote,
            role,
            channel_id,
            link_kind,
            peer_addr,
            next_stream: AtomicU32::new(first_stream),
            state: state_tx,
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            max_payload: config.max_payload(),
        });

        tracing::info!(
            peer = %shared.peer(),
            channel = %hex::encode(channel_id),
            ?role,
            ?link_kind,
            "Secure channel established"
        );

        tokio::spawn(run_writer(
            shared.clone(),
            sink,
            send_cipher,
            out_rx,
            config.idle_timeout,
        ));
        tokio::spawn(run_reader(shared.clone(), source, recv_cipher, in_tx));

        Self {
            shared,
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            state_rx,
        }
    }

    /// Authenticated identity of the remote node.
    #[must_use]
    pub fn remote(&self) -> &PublicIdentity {
        &self.shared.remote
    }

    /// Handshake role this side played.
    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Identifier shared by both ends, for logging.
    #[must_use]
    pub fn channel_id(&self) -> [u8; 8] {
        self.shared.channel_id
    }

    /// Whether the channel runs over a direct link or a relay tunnel.
    #[must_use]
    pub fn link_kind(&self) -> LinkKind {
        self.shared.link_kind
    }

    /// Remote socket address for direct links.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Whether the channel is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Time since the last frame in either direction.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.shared.idle_for()
    }

    /// Wait until the channel leaves the open state and return the final state.
    pub async fn closed(&self) -> ChannelState {
        let mut rx = self.state_rx.clone();
        match rx.wait_for(|state| !state.is_open()).await {
            Ok(state) => *state,
            Err(_) => ChannelState::Closed(CloseReason::LinkLost),
        }
    }

    /// Allocate a fresh stream identifier.
    ///
    /// Initiators get odd identifiers and responders even ones, so both ends
    /// can allocate without coordination. Identifiers are never reused.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::StreamsExhausted` when the identifier space is
    /// used up.
    pub fn open_stream(&self) -> Result<StreamId, ChannelError> {
        self.shared
            .next_stream
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(2))
            .map_err(|_| ChannelError::StreamsExhausted)
    }

    /// Queue a payload on a stream.
    ///
    /// Waits while the outbound queue is full.
    ///
    /// # Errors
    ///
    /// - `ChannelError::PayloadTooLarge` if the payload does not fit a frame
    /// - `ChannelError::Corrupted` or `ChannelError::Closed` once the channel
    ///   is no longer open
    pub async fn send(&self, stream_id: StreamId, payload: Vec<u8>) -> Result<(), ChannelError> {
        if payload.len() > self.shared.max_payload {
            return Err(ChannelError::PayloadTooLarge {
                size: payload.len(),
                max: self.shared.max_payload,
            });
        }
        self.enqueue(Outbound::Frame(InnerFrame::data(stream_id, payload)))
            .await
    }

    /// Queue a keepalive frame.
    ///
    /// # Errors
    ///
    /// Fails like [`send`](Self::send) once the channel is no longer open.
    pub async fn keepalive(&self) -> Result<(), ChannelError> {
        self.enqueue(Outbound::Frame(InnerFrame::control(FrameType::Keepalive)))
            .await
    }

    async fn enqueue(&self, item: Outbound) -> Result<(), ChannelError> {
        let state = self.state();
        if !state.is_open() {
            return Err(state.as_error());
        }
        self.outbound
            .send(item)
            .await
            .map_err(|_| self.state().as_error())
    }

    /// Next authenticated data frame, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Corrupted` after an integrity failure and
    /// `ChannelError::Closed` once the channel has closed and the inbound
    /// queue is drained.
    pub async fn receive(&self) -> Result<(StreamId, Vec<u8>), ChannelError> {
        if self.state() == ChannelState::Corrupted {
            return Err(ChannelError::Corrupted);
        }
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(frame) => Ok(frame),
            None => Err(self.state().as_error()),
        }
    }

    /// Send an orderly close after everything already queued and wait for
    /// the channel to shut down.
    pub async fn close(&self) {
        if self.outbound.send(Outbound::Close).await.is_ok() {
            self.closed().await;
        }
    }
}

fn idle_check_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(5))
}

async fn seal_and_send(
    sink: &mut dyn FrameSink,
    cipher: &mut SendCipher,
    frame: &InnerFrame,
) -> Result<(), CloseReason> {
    let (sequence, ciphertext) = cipher.seal(&frame.encode()).map_err(|e| {
        tracing::warn!(error = %e, "Send cipher exhausted");
        CloseReason::Local
    })?;
    sink.send_frame(encode_sealed(sequence, &ciphertext))
        .await
        .map_err(|e| {
            tracing::debug!(error = %e, "Link write failed");
            CloseReason::LinkLost
        })
}

async fn run_writer(
    shared: Arc<Shared>,
    mut sink: Box<dyn FrameSink>,
    mut cipher: SendCipher,
    mut queue: mpsc::Receiver<Outbound>,
    idle_timeout: Duration,
) {
    let mut state = shared.state.subscribe();
    let mut idle_check = tokio::time::interval(idle_check_period(idle_timeout));
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            changed = state.changed() => {
                if changed.is_err() || !state.borrow().is_open() {
                    break;
                }
            }

            _ = idle_check.tick() => {
                if shared.idle_for() >= idle_timeout {
                    shared.transition(ChannelState::Closed(CloseReason::Idle));
                    let _ = seal_and_send(
                        sink.as_mut(),
                        &mut cipher,
                        &InnerFrame::control(FrameType::Close),
                    )
                    .await;
                    break;
                }
            }

            item = queue.recv() => match item {
                Some(Outbound::Frame(frame)) => {
                    if let Err(reason) = seal_and_send(sink.as_mut(), &mut cipher, &frame).await {
                        shared.transition(ChannelState::Closed(reason));
                        break;
                    }
                    shared.touch();
                    tracing::trace!(
                        peer = %shared.peer(),
                        stream = frame.stream_id,
                        len = frame.payload.len(),
                        "Frame sent"
                    );
                }
                // Explicit close, or every channel handle dropped.
                Some(Outbound::Close) | None => {
                    let _ = seal_and_send(
                        sink.as_mut(),
                        &mut cipher,
                        &InnerFrame::control(FrameType::Close),
                    )
                    .await;
                    shared.transition(ChannelState::Closed(CloseReason::Local));
                    break;
                }
            },
        }
    }

    let _ = sink.shutdown().await;
}

fn open_frame(cipher: &mut RecvCipher, body: &[u8]) -> Option<InnerFrame> {
    let (sequence, ciphertext) = decode_sealed(body)?;
    match cipher.open(sequence, ciphertext) {
        Ok(plaintext) => InnerFrame::decode(&plaintext),
        Err(e) => {
            tracing::debug!(error = %e, sequence, "Frame rejected");
            None
        }
    }
}

async fn run_reader(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    mut cipher: RecvCipher,
    inbound: mpsc::Sender<(StreamId, Vec<u8>)>,
) {
    let mut state = shared.state.subscribe();

    // Every branch other than the frame branch exits the loop, so dropping a
    // partially read frame is harmless.
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || !state.borrow().is_open() {
                    break;
                }
            }

            received = source.recv_frame() => {
                let body = match received {
                    Ok(Some(body)) => body,
                    Ok(None) => {
                        shared.transition(ChannelState::Closed(CloseReason::LinkLost));
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %shared.peer(), error = %e, "Link read failed");
                        shared.transition(ChannelState::Closed(CloseReason::LinkLost));
                        break;
                    }
                };

                let Some(frame) = open_frame(&mut cipher, &body) else {
                    shared.transition(ChannelState::Corrupted);
                    break;
                };
                shared.touch();

                match frame.kind {
                    FrameType::Data => {
                        tracing::trace!(
                            peer = %shared.peer(),
                            stream = frame.stream_id,
                            len = frame.payload.len(),
                            "Frame received"
                        );
                        if inbound.send((frame.stream_id, frame.payload)).await.is_err() {
                            // No receiver left; the writer side closes the channel.
                            break;
                        }
                    }
                    FrameType::Keepalive => {
                        tracing::trace!(peer = %shared.peer(), "Keepalive received");
                    }
                    FrameType::Close => {
                        shared.transition(ChannelState::Closed(CloseReason::Remote));
                        break;
                    }
                }
            }
        }
    }
}
