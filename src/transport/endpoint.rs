//! # Endpoints
//!
//! TCP and WebSocket client/server entry points. An [`Endpoint`] bundles
//! the registry, the connection options and the dispatcher; every
//! connection it produces is registered and serviced by the scheduler.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerwire::protocol::dispatcher::Dispatcher;
//! use peerwire::transport::endpoint::Endpoint;
//! use peerwire::transport::options::ConnectionOptions;
//! use peerwire::transport::registry::Registry;
//!
//! # async fn run() -> peerwire::error::Result<()> {
//! let endpoint = Endpoint::new(
//!     Registry::new(),
//!     ConnectionOptions::default(),
//!     Arc::new(Dispatcher::new()),
//! );
//! let listener = endpoint.listen("127.0.0.1:0").await?;
//! let conn = endpoint.connect(&listener.local_addr().to_string()).await?;
//! conn.close();
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::envelope::Envelope;
use crate::core::frame::HEADER_LEN;
use crate::core::gate::TypeGate;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::identity::PeerId;
use crate::protocol::negotiation::LinkToken;
use crate::transport::connection::{Connection, Role};
use crate::transport::options::ConnectionOptions;
use crate::transport::registry::Registry;
use crate::transport::stream::{TransportKind, TransportStream};

#[derive(Clone)]
pub struct Endpoint {
    registry: Arc<Registry>,
    options: ConnectionOptions,
    dispatcher: Arc<Dispatcher>,
}

/// A running accept loop. Dropping it stops accepting; established
/// connections are unaffected.
pub struct Listener {
    local_addr: SocketAddr,
    kind: TransportKind,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Largest first frame a direct listener reads before adopting a dialer.
const MAX_LINK_TOKEN_FRAME: usize = 1024;

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ProtocolError::ConfigError(format!("address '{addr}' did not resolve")))
}

impl Endpoint {
    pub fn new(
        registry: Arc<Registry>,
        options: ConnectionOptions,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            registry,
            options,
            dispatcher,
        }
    }

    /// Fresh registry, options and dispatcher from configuration.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        Ok(Self::new(
            Registry::from_config(config),
            ConnectionOptions::from_config(config)?,
            Arc::new(Dispatcher::new()),
        ))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Dial a TCP server.
    #[instrument(skip(self), fields(transport = "tcp"))]
    pub async fn connect(&self, addr: &str) -> Result<Connection> {
        let stream = self.dial(addr).await?;
        self.adopt(TransportStream::Tcp(stream), Role::Client, None)
    }

    /// Dial a peer's direct listener, present `token` as the first frame and
    /// tag the connection with the peer it leads to.
    #[instrument(skip(self, token), fields(transport = "tcp"))]
    pub async fn connect_peer(&self, addr: &str, peer: PeerId, token: u64) -> Result<Connection> {
        let mut stream = self.dial(addr).await?;
        let first = self.options.codec.encode(&Envelope::wrap(&LinkToken { token }))?;
        tokio::time::timeout(self.options.timeout, stream.write_all(&first))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        self.adopt(TransportStream::Tcp(stream), Role::Client, Some(peer))
    }

    /// Adopt a dialer on a direct listener once its first frame carries
    /// `token`. Anything else closes the stream unadopted.
    pub async fn adopt_peer(&self, mut stream: TcpStream, peer: PeerId, token: u64) -> Result<Connection> {
        let presented = tokio::time::timeout(self.options.timeout, self.read_link_token(&mut stream))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        if presented != token {
            return Err(ProtocolError::TransportError(constants::ERR_LINK_TOKEN.to_string()));
        }
        self.adopt(TransportStream::Tcp(stream), Role::Server, Some(peer))
    }

    async fn read_link_token(&self, stream: &mut TcpStream) -> Result<u64> {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let declared = u32::from_be_bytes(header) as usize;
        if declared > MAX_LINK_TOKEN_FRAME {
            return Err(ProtocolError::FrameTooLarge(declared));
        }
        let mut payload = vec![0u8; declared];
        stream.read_exact(&mut payload).await?;

        let gate = TypeGate::new().allow_type::<LinkToken>();
        let (first, _) = self
            .options
            .codec
            .decode(&payload)?
            .unwrap::<LinkToken>(&gate)?;
        Ok(first.token)
    }

    /// Dial a WebSocket server (`ws://host:port/path`).
    #[instrument(skip(self), fields(transport = "websocket"))]
    pub async fn connect_websocket(&self, url: &str) -> Result<Connection> {
        let (ws, _response) =
            tokio::time::timeout(self.options.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| ProtocolError::Timeout)?
                .map_err(|e| ProtocolError::TransportError(e.to_string()))?;
        self.adopt(TransportStream::WsClient(ws), Role::Client, None)
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Accept TCP connections on `addr`.
    #[instrument(skip(self), fields(transport = "tcp"))]
    pub async fn listen(&self, addr: &str) -> Result<Listener> {
        let listener = self.bind(addr).await?;
        self.serve(listener, TransportKind::Tcp)
    }

    /// Accept WebSocket connections on `addr`.
    #[instrument(skip(self), fields(transport = "websocket"))]
    pub async fn listen_websocket(&self, addr: &str) -> Result<Listener> {
        let listener = self.bind(addr).await?;
        self.serve(listener, TransportKind::WebSocket)
    }

    async fn bind(&self, addr: &str) -> Result<TcpListener> {
        let addr = resolve(addr).await?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.options.backlog)?)
    }

    /// Run the accept loop on an already bound listener.
    pub fn serve(&self, listener: TcpListener, kind: TransportKind) -> Result<Listener> {
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();
        info!(address = %local_addr, ?kind, "Listening");

        let endpoint = self.clone();
        let stop = token.clone();
        let task = tokio::spawn(async move {
            let mut incoming = TcpListenerStream::new(listener);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        info!(address = %local_addr, "Listener shutting down");
                        break;
                    }
                    next = incoming.next() => match next {
                        Some(Ok(stream)) => endpoint.accept(stream, kind),
                        Some(Err(e)) => error!(error = %e, "Error accepting connection"),
                        None => break,
                    }
                }
            }
        });

        Ok(Listener {
            local_addr,
            kind,
            token,
            task,
        })
    }

    fn accept(&self, stream: TcpStream, kind: TransportKind) {
        let remote = stream.peer_addr().ok();
        if self.registry.server_count() >= self.options.max_connections {
            warn!(?remote, max = self.options.max_connections, "Connection limit reached, dropping");
            return;
        }
        let _ = stream.set_nodelay(true);

        let endpoint = self.clone();
        tokio::spawn(async move {
            let transport = match kind {
                TransportKind::Tcp => Ok(TransportStream::Tcp(stream)),
                TransportKind::WebSocket => tokio::time::timeout(
                    endpoint.options.timeout,
                    tokio_tungstenite::accept_async(stream),
                )
                .await
                .map_err(|_| ProtocolError::Timeout)
                .and_then(|r| r.map_err(|e| ProtocolError::TransportError(e.to_string())))
                .map(TransportStream::WsServer),
            };

            match transport.and_then(|t| endpoint.adopt(t, Role::Server, None)) {
                Ok(conn) => debug!(conn = conn.id(), ?remote, "Accepted connection"),
                Err(e) => warn!(?remote, error = %e, "Failed to accept connection"),
            }
        });
    }

    /// Register an established stream and run the connect callbacks.
    ///
    /// `remote_peer` tags direct P2P connections with the peer on the other end.
    pub fn adopt(
        &self,
        stream: TransportStream,
        role: Role,
        remote_peer: Option<PeerId>,
    ) -> Result<Connection> {
        let conn = Connection::new(
            self.registry.next_id(),
            role,
            stream,
            self.options.clone(),
            Arc::clone(&self.dispatcher),
            &self.registry,
        );
        if let Some(peer) = remote_peer {
            conn.set_remote_peer(peer);
        }

        if let Err(e) = self.registry.register(conn.clone()) {
            conn.close();
            return Err(e);
        }
        self.dispatcher.notify_connect(&conn);
        conn.mark_connected();

        info!(conn = conn.id(), ?role, remote = %conn.remote_addr(), kind = ?conn.kind(), "Connection established");
        Ok(conn)
    }
}
