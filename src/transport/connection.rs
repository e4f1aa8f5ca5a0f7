//! # Connection
//!
//! Per-socket state serviced by the scheduler: a FIFO queue of encoded
//! frames, the receive buffer with its frame decoder, bandwidth meters and
//! the socket halves.
//!
//! Callers never block: [`Connection::send`] encodes and enqueues, and the
//! registry's workers move bytes. Received envelopes are handed to the
//! shared [`Dispatcher`].
//!
//! Error handling follows [`ProtocolError::is_connection_scoped`]: a
//! connection-scoped error closes and unregisters the connection, anything
//! else is reported on the error channel and only the message is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::core::envelope::Envelope;
use crate::core::frame::FrameCodec;
use crate::core::wire::Wire;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, MessageContext};
use crate::protocol::identity::PeerId;
use crate::transport::options::ConnectionOptions;
use crate::transport::registry::Registry;
use crate::transport::stream::{LinkHealth, ReadEvent, TransportKind, TransportStream, TransportWriter};
use crate::utils::bandwidth::BandwidthMeter;
use crate::utils::metrics::Metrics;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub id: ConnectionId,
    pub role: Role,
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub remote_addr: SocketAddr,
    /// Bytes sent during the last completed one-second window
    pub upload_rate: u64,
    /// Bytes received during the last completed one-second window
    pub download_rate: u64,
    pub queued_frames: usize,
    pub buffered_bytes: usize,
    pub age: Duration,
}

struct Inbound {
    rx: mpsc::Receiver<ReadEvent>,
    /// A chunk that did not fit the download window yet.
    held: Option<Bytes>,
}

struct ConnectionInner {
    id: ConnectionId,
    role: Role,
    kind: TransportKind,
    remote_addr: SocketAddr,
    state: AtomicU8,
    send_queue: Mutex<VecDeque<Bytes>>,
    sending: AtomicBool,
    receiving: AtomicBool,
    inbound: Mutex<Inbound>,
    buffer: Mutex<BytesMut>,
    frames: FrameCodec,
    writer: Arc<tokio::sync::Mutex<TransportWriter>>,
    health: Arc<LinkHealth>,
    upload: BandwidthMeter,
    download: BandwidthMeter,
    created: Instant,
    closed: CancellationToken,
    options: ConnectionOptions,
    dispatcher: Arc<Dispatcher>,
    registry: Weak<Registry>,
    metrics: Arc<Metrics>,
    remote_peer: OnceLock<PeerId>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one connection. Clones share the same state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("kind", &self.inner.kind)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Clears a per-connection drain flag when dropped.
struct DrainGuard {
    inner: Arc<ConnectionInner>,
    flag: fn(&ConnectionInner) -> &AtomicBool,
}

impl DrainGuard {
    fn acquire(inner: &Arc<ConnectionInner>, flag: fn(&ConnectionInner) -> &AtomicBool) -> Option<Self> {
        flag(inner)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                inner: Arc::clone(inner),
                flag,
            })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        (self.flag)(&self.inner).store(false, Ordering::Release);
    }
}

impl Connection {
    /// Wrap a connected stream. The connection starts in `Connecting`;
    /// sends are queued but nothing is drained until it is marked connected.
    pub(crate) fn new(
        id: ConnectionId,
        role: Role,
        stream: TransportStream,
        options: ConnectionOptions,
        dispatcher: Arc<Dispatcher>,
        registry: &Arc<Registry>,
    ) -> Self {
        let kind = stream.kind();
        let remote_addr = stream
            .peer_addr()
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let health = Arc::new(LinkHealth::new());
        let (writer, rx, reader) = stream.split(options.read_buffer_size, Arc::clone(&health));

        let inner = ConnectionInner {
            id,
            role,
            kind,
            remote_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            send_queue: Mutex::new(VecDeque::new()),
            sending: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            inbound: Mutex::new(Inbound { rx, held: None }),
            buffer: Mutex::new(BytesMut::with_capacity(options.read_buffer_size)),
            frames: FrameCodec::new(options.max_buffer_size),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            health,
            upload: BandwidthMeter::new(options.upload_limit),
            download: BandwidthMeter::new(options.download_limit),
            created: Instant::now(),
            closed: CancellationToken::new(),
            options,
            dispatcher,
            registry: Arc::downgrade(registry),
            metrics: registry.metrics(),
            remote_peer: OnceLock::new(),
            reader: Mutex::new(Some(reader)),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Peer on the other end of a direct P2P connection.
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.inner.remote_peer.get().copied()
    }

    pub(crate) fn set_remote_peer(&self, peer: PeerId) {
        let _ = self.inner.remote_peer.set(peer);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Closing or closed; the scheduler skips such connections.
    pub fn is_closed(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    pub(crate) fn accepts_sends(&self) -> bool {
        self.state() <= ConnectionState::Connected
    }

    pub(crate) fn mark_connected(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Encode and enqueue one object.
    pub fn send<T: Wire>(&self, object: &T) -> Result<()> {
        self.send_envelope(Envelope::wrap(object))
    }

    /// Encode and enqueue a prepared envelope. Never blocks.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        if !self.accepts_sends() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame = self.inner.options.codec.encode(&envelope)?;
        trace!(conn = self.inner.id, type_key = %envelope.type_key, bytes = frame.len(), "Frame queued");
        self.inner.send_queue.lock().push_back(frame);
        self.inner.metrics.message_sent();
        Ok(())
    }

    /// Wait until every queued frame has been written.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let drained = async {
            loop {
                if self.is_closed() {
                    return Err(ProtocolError::ConnectionClosed);
                }
                let idle = self.inner.send_queue.lock().is_empty()
                    && !self.inner.sending.load(Ordering::Acquire);
                if idle {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(timeout, drained)
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.inner.id,
            role: self.inner.role,
            kind: self.inner.kind,
            state: self.state(),
            remote_addr: self.inner.remote_addr,
            upload_rate: self.inner.upload.rate(),
            download_rate: self.inner.download.rate(),
            queued_frames: self.inner.send_queue.lock().len(),
            buffered_bytes: self.inner.buffer.lock().len(),
            age: self.inner.created.elapsed(),
        }
    }

    /// Close and unregister. Idempotent.
    pub fn close(&self) {
        let moved = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            })
            .is_ok();
        if !moved {
            return;
        }

        self.inner.closed.cancel();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.unregister(self.inner.id);
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let writer = Arc::clone(&self.inner.writer);
            let timeout = self.inner.options.timeout;
            runtime.spawn(async move {
                if let Ok(mut writer) = tokio::time::timeout(timeout, writer.lock()).await {
                    let _ = tokio::time::timeout(timeout, writer.shutdown()).await;
                }
            });
        }

        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        info!(conn = self.inner.id, remote = %self.inner.remote_addr, "Connection closed");
        self.inner.dispatcher.notify_disconnect(self);
    }

    /// Report `error`; close too if it is connection-scoped.
    pub(crate) fn fail(&self, error: ProtocolError) {
        let fatal = error.is_connection_scoped();
        self.report_error(&error);
        if fatal {
            self.close();
        }
    }

    pub(crate) fn report_error(&self, error: &ProtocolError) {
        let metrics = &self.inner.metrics;
        match error {
            ProtocolError::TypeNotAllowed { type_key, blacklisted } => {
                metrics.type_rejected();
                warn!(conn = self.inner.id, %type_key, blacklisted, "Message rejected by type gate");
            }
            ProtocolError::FrameTooLarge(size) => {
                metrics.frame_oversized();
                metrics.connection_error();
                error!(conn = self.inner.id, size, "Frame exceeds buffer cap");
            }
            e if e.is_connection_scoped() => {
                metrics.connection_error();
                error!(conn = self.inner.id, error = %e, "Connection failed");
            }
            e => {
                metrics.protocol_error();
                warn!(conn = self.inner.id, error = %e, "Message dropped");
            }
        }
        self.inner.dispatcher.notify_error(self, error);
    }

    /// Liveness probe plus heartbeat; run by the connection-check worker.
    pub(crate) fn check_liveness(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let limit = self.inner.options.timeout.as_millis() as u64 * 2;
        if self.inner.health.has_failed() || self.inner.health.silent_for_ms() > limit {
            return Err(ProtocolError::ConnectionTimeout);
        }
        self.send_envelope(Envelope::heartbeat())?;
        self.inner.metrics.heartbeat_sent();
        Ok(())
    }

    /// Close the bandwidth windows; run by the counter worker once a second.
    pub(crate) fn roll_counters(&self) {
        let up = self.inner.upload.roll();
        let down = self.inner.download.roll();
        if up > 0 || down > 0 {
            trace!(conn = self.inner.id, up, down, "Bandwidth window closed");
        }
    }

    /// Dequeue what the upload window allows and write it on a spawned task.
    pub(crate) fn drain_send(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let Some(guard) = DrainGuard::acquire(&self.inner, |c| &c.sending) else {
            return Ok(());
        };

        let batch: Vec<Bytes> = {
            let mut queue = self.inner.send_queue.lock();
            let mut batch = Vec::new();
            while let Some(front) = queue.front() {
                if !self.inner.upload.allows(front.len()) {
                    break;
                }
                self.inner.upload.record(front.len());
                if let Some(frame) = queue.pop_front() {
                    batch.push(frame);
                }
            }
            batch
        };
        if batch.is_empty() {
            return Ok(());
        }

        let conn = self.clone();
        tokio::spawn(async move {
            conn.write_batch(batch).await;
            drop(guard);
        });
        Ok(())
    }

    async fn write_batch(&self, batch: Vec<Bytes>) {
        let timeout = self.inner.options.timeout;
        let mut writer = tokio::select! {
            _ = self.inner.closed.cancelled() => return,
            writer = self.inner.writer.lock() => writer,
        };

        let count = batch.len();
        for frame in batch {
            if !self.is_open() {
                debug!(conn = self.inner.id, "Connection closed mid-batch, dropping rest");
                return;
            }
            let len = frame.len() as u64;
            let written = tokio::select! {
                _ = self.inner.closed.cancelled() => return,
                r = tokio::time::timeout(timeout, writer.write_frame(frame)) => r,
            };
            match written {
                Ok(Ok(())) => self.inner.metrics.bytes_written(len),
                Ok(Err(e)) => {
                    drop(writer);
                    self.fail(transport_error(e));
                    return;
                }
                Err(_) => {
                    drop(writer);
                    self.fail(ProtocolError::ConnectionTimeout);
                    return;
                }
            }
        }

        let flushed = tokio::select! {
            _ = self.inner.closed.cancelled() => return,
            r = tokio::time::timeout(timeout, writer.flush()) => r,
        };
        drop(writer);
        match flushed {
            Ok(Ok(())) => trace!(conn = self.inner.id, frames = count, "Batch written"),
            Ok(Err(e)) => self.fail(transport_error(e)),
            Err(_) => self.fail(ProtocolError::ConnectionTimeout),
        }
    }

    /// Pull read chunks the download window allows, split complete frames
    /// and hand them on. Partial frames stay buffered.
    pub(crate) fn drain_receive(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        let Some(_guard) = DrainGuard::acquire(&self.inner, |c| &c.receiving) else {
            return Ok(());
        };

        let mut payloads = Vec::new();
        let mut ended: Option<Option<ProtocolError>> = None;
        {
            let mut inbound = self.inner.inbound.lock();
            let mut buffer = self.inner.buffer.lock();
            let mut frames = self.inner.frames;
            loop {
                let chunk = match inbound.held.take() {
                    Some(chunk) => chunk,
                    None => match inbound.rx.try_recv() {
                        Ok(ReadEvent::Data(chunk)) => chunk,
                        Ok(ReadEvent::Closed) | Err(TryRecvError::Disconnected) => {
                            ended = Some(None);
                            break;
                        }
                        Ok(ReadEvent::Failed(reason)) => {
                            ended = Some(Some(ProtocolError::TransportError(reason)));
                            break;
                        }
                        Err(TryRecvError::Empty) => break,
                    },
                };
                if !self.inner.download.allows(chunk.len()) {
                    inbound.held = Some(chunk);
                    break;
                }
                self.inner.download.record(chunk.len());
                self.inner.metrics.bytes_read(chunk.len() as u64);
                buffer.extend_from_slice(&chunk);

                // A declared length over the cap fails here, before its body
                // is buffered, so the remainder never outgrows one frame.
                while let Some(payload) = frames.decode(&mut buffer)? {
                    payloads.push(payload);
                }
            }
        }

        for payload in payloads {
            if self.is_closed() {
                break;
            }
            self.handle_frame(&payload);
        }

        match ended {
            Some(Some(e)) => Err(e),
            Some(None) => {
                debug!(conn = self.inner.id, "Remote end closed");
                self.close();
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn handle_frame(&self, payload: &[u8]) {
        let envelope = match self.inner.options.codec.decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        // Heartbeats skip the gate and the dispatcher.
        if envelope.is_heartbeat() {
            if let Err(e) = self.send_envelope(Envelope::heartbeat_ack()) {
                self.fail(e);
            }
            return;
        }
        if envelope.is_heartbeat_ack() {
            return;
        }

        self.deliver(envelope, None);
    }

    /// Gate-check and dispatch one envelope. Every failure here is
    /// message-scoped, including errors returned by handlers.
    pub(crate) fn deliver(&self, envelope: Envelope, sender: Option<PeerId>) {
        self.inner.metrics.message_received();
        let type_key = envelope.type_key.clone();
        let ctx = MessageContext::new(self.clone(), sender.or_else(|| self.remote_peer()));
        match self
            .inner
            .dispatcher
            .dispatch(&ctx, envelope, &self.inner.options.gate)
        {
            Ok(field_errors) => {
                for e in &field_errors {
                    self.report_error(e);
                }
            }
            Err(e) => {
                debug!(conn = self.inner.id, %type_key, "Delivery failed");
                self.report_error(&e);
            }
        }
    }
}

fn transport_error(e: ProtocolError) -> ProtocolError {
    match e {
        ProtocolError::Io(io) => ProtocolError::TransportError(io.to_string()),
        other => other,
    }
}
