//! Socket halves behind one interface for TCP and WebSocket.
//!
//! Reads happen on a per-connection task that forwards raw chunks over a
//! bounded channel; the scheduler's receive workers consume that channel.
//! Writes go through [`TransportWriter`], one frame at a time. A WebSocket
//! carries each length-prefixed frame as one binary message, so both
//! transports feed the same frame decoder.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};

/// Chunks buffered between the reader task and the receive worker.
const READ_CHANNEL_CAPACITY: usize = 64;

type WsClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsServerStream = WebSocketStream<TcpStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

/// A connected byte stream.
pub enum TransportStream {
    Tcp(TcpStream),
    WsClient(WsClientStream),
    WsServer(WsServerStream),
}

/// What the reader task observed.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    Data(Bytes),
    Closed,
    Failed(String),
}

/// Socket-level liveness shared between the reader task and the connection.
#[derive(Debug)]
pub(crate) struct LinkHealth {
    epoch: Instant,
    last_read_ms: AtomicU64,
    failed: AtomicBool,
}

impl LinkHealth {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_read_ms.store(now, Ordering::Release);
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Milliseconds since the socket last produced bytes.
    pub(crate) fn silent_for_ms(&self) -> u64 {
        let now = self.epoch.elapsed().as_millis() as u64;
        now.saturating_sub(self.last_read_ms.load(Ordering::Acquire))
    }
}

impl TransportStream {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportStream::Tcp(_) => TransportKind::Tcp,
            TransportStream::WsClient(_) | TransportStream::WsServer(_) => TransportKind::WebSocket,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            TransportStream::Tcp(s) => s.peer_addr().ok(),
            TransportStream::WsServer(ws) => ws.get_ref().peer_addr().ok(),
            TransportStream::WsClient(ws) => match ws.get_ref() {
                MaybeTlsStream::Plain(s) => s.peer_addr().ok(),
                #[allow(unreachable_patterns)]
                _ => None,
            },
        }
    }

    /// Split into a writer and a spawned reader task.
    pub(crate) fn split(
        self,
        chunk_size: usize,
        health: Arc<LinkHealth>,
    ) -> (TransportWriter, mpsc::Receiver<ReadEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        match self {
            TransportStream::Tcp(stream) => {
                let (read, write) = stream.into_split();
                let reader = tokio::spawn(pump_tcp(read, chunk_size, tx, health));
                (TransportWriter::Tcp(write), rx, reader)
            }
            TransportStream::WsClient(ws) => {
                let (sink, source) = ws.split();
                let reader = tokio::spawn(pump_websocket::<SplitStream<WsClientStream>>(
                    source, tx, health,
                ));
                (TransportWriter::WsClient(sink), rx, reader)
            }
            TransportStream::WsServer(ws) => {
                let (sink, source) = ws.split();
                let reader = tokio::spawn(pump_websocket::<SplitStream<WsServerStream>>(
                    source, tx, health,
                ));
                (TransportWriter::WsServer(sink), rx, reader)
            }
        }
    }
}

async fn pump_tcp(
    mut read: OwnedReadHalf,
    chunk_size: usize,
    tx: mpsc::Sender<ReadEvent>,
    health: Arc<LinkHealth>,
) {
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        let event = match read.read_buf(&mut buf).await {
            Ok(0) => ReadEvent::Closed,
            Ok(n) => {
                health.touch();
                trace!(bytes = n, "Socket read");
                ReadEvent::Data(buf.split().freeze())
            }
            Err(e) => {
                health.mark_failed();
                ReadEvent::Failed(e.to_string())
            }
        };
        let terminal = !matches!(event, ReadEvent::Data(_));
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
}

async fn pump_websocket<S>(mut source: S, tx: mpsc::Sender<ReadEvent>, health: Arc<LinkHealth>)
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    loop {
        let event = match source.next().await {
            Some(Ok(Message::Binary(data))) => {
                health.touch();
                ReadEvent::Data(data)
            }
            Some(Ok(Message::Text(text))) => {
                health.touch();
                ReadEvent::Data(Bytes::copy_from_slice(text.as_str().as_bytes()))
            }
            Some(Ok(Message::Close(_))) | None => ReadEvent::Closed,
            Some(Ok(_)) => {
                // ping/pong are answered by tungstenite itself
                health.touch();
                continue;
            }
            Some(Err(e)) => {
                health.mark_failed();
                ReadEvent::Failed(e.to_string())
            }
        };
        let terminal = !matches!(event, ReadEvent::Data(_));
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
    debug!("WebSocket reader finished");
}

/// Write half of a [`TransportStream`].
pub(crate) enum TransportWriter {
    Tcp(OwnedWriteHalf),
    WsClient(SplitSink<WsClientStream, Message>),
    WsServer(SplitSink<WsServerStream, Message>),
}

fn ws_error(e: WsError) -> ProtocolError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ProtocolError::ConnectionClosed,
        WsError::Io(io) => ProtocolError::Io(io),
        other => ProtocolError::TransportError(other.to_string()),
    }
}

impl TransportWriter {
    /// Queue one complete frame (header included) on the socket.
    pub(crate) async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        match self {
            TransportWriter::Tcp(w) => w.write_all(&frame).await.map_err(ProtocolError::from),
            TransportWriter::WsClient(sink) => sink.feed(Message::Binary(frame)).await.map_err(ws_error),
            TransportWriter::WsServer(sink) => sink.feed(Message::Binary(frame)).await.map_err(ws_error),
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        match self {
            TransportWriter::Tcp(w) => w.flush().await.map_err(ProtocolError::from),
            TransportWriter::WsClient(sink) => SinkExt::flush(sink).await.map_err(ws_error),
            TransportWriter::WsServer(sink) => SinkExt::flush(sink).await.map_err(ws_error),
        }
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        match self {
            TransportWriter::Tcp(w) => w.shutdown().await.map_err(ProtocolError::from),
            TransportWriter::WsClient(sink) => SinkExt::close(sink).await.map_err(ws_error),
            TransportWriter::WsServer(sink) => SinkExt::close(sink).await.map_err(ws_error),
        }
    }
}
