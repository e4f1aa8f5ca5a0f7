//! # Peer Client
//!
//! One hub connection plus any number of direct links to other peers.
//!
//! The local identity and the mirror of remote identities are read-only:
//! only `Identifier` messages arriving on the hub connection change them.
//! Objects for another peer go over a direct link when one is open and
//! through the hub as a [`RedirectEnvelope`] otherwise.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use peerwire::config::NetworkConfig;
//! use peerwire::service::peer::PeerClient;
//!
//! # async fn run() -> peerwire::error::Result<()> {
//! let mut config = NetworkConfig::default();
//! config.client.address = "127.0.0.1:7000".into();
//! let client = PeerClient::connect(&config).await?;
//! let me = client.wait_for_identity(Duration::from_secs(5)).await?;
//! println!("joined as {}", me.id);
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{NetworkConfig, P2pConfig};
use crate::core::wire::Wire;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, MessageContext};
use crate::protocol::identity::{IdentityAction, Identifier, PeerDirectory, PeerId, PeerIdentity};
use crate::protocol::negotiation::{is_control_plane, PeerServerNegotiation, RedirectEnvelope, RoutingFailure};
use crate::transport::connection::Connection;
use crate::transport::endpoint::Endpoint;
use crate::transport::registry::Registry;
use crate::utils::ports::bind_in_range;

/// How [`PeerClient::send_to`] delivered an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relayed,
}

struct PeerState {
    endpoint: Endpoint,
    p2p: P2pConfig,
    hub: OnceLock<Connection>,
    identity: watch::Sender<Option<PeerIdentity>>,
    remotes: PeerDirectory,
    direct: DashMap<PeerId, Connection>,
    offers: Mutex<Vec<PeerServerNegotiation>>,
}

#[derive(Clone)]
pub struct PeerClient {
    state: Arc<PeerState>,
}

fn spoofed(type_key: &str) -> ProtocolError {
    ProtocolError::TypeNotAllowed {
        type_key: type_key.to_string(),
        blacklisted: true,
    }
}

impl PeerState {
    /// Direct links always carry a remote peer id; the hub link never does.
    fn from_hub(&self, conn: &Connection) -> bool {
        match self.hub.get() {
            Some(hub) => hub.id() == conn.id(),
            None => conn.remote_peer().is_none(),
        }
    }

    fn local_id(&self) -> Option<PeerId> {
        self.identity.borrow().as_ref().map(|identity| identity.id)
    }

    fn hub(&self) -> Result<&Connection> {
        self.hub.get().ok_or(ProtocolError::ConnectionClosed)
    }

    fn serializer(&self) -> &'static str {
        self.endpoint.options().codec.serializer_name()
    }

    /// Track `conn` as the direct link to `peer`, closing any link it replaces.
    fn link(&self, peer: PeerId, conn: Connection) {
        info!(%peer, conn = conn.id(), "Direct link established");
        if let Some(old) = self.direct.insert(peer, conn.clone()) {
            if old.id() != conn.id() {
                old.close();
            }
        }
    }

    fn on_identifier(&self, ctx: &MessageContext, identifier: Identifier) -> Result<()> {
        if !self.from_hub(ctx.connection()) {
            return Err(spoofed(Identifier::TYPE_KEY));
        }
        let mirror = PeerIdentity::from_identifier(&identifier);
        match identifier.action {
            IdentityAction::LocalIdentity => {
                info!(id = %mirror.id, "Local identity assigned");
                self.identity.send_replace(Some(mirror));
            }
            IdentityAction::MetadataUpdate if Some(identifier.id) == self.local_id() => {
                self.identity.send_modify(|current| {
                    if let Some(local) = current {
                        local.public_metadata = mirror.public_metadata;
                        if mirror.ip.is_some() {
                            local.ip = mirror.ip;
                        }
                    }
                });
            }
            IdentityAction::RemoteIdentity | IdentityAction::MetadataUpdate => {
                debug!(peer = %mirror.id, "Remote identity updated");
                self.remotes.insert(mirror);
            }
            IdentityAction::Dispose => {
                self.remotes.remove(identifier.id);
                if let Some((_, conn)) = self.direct.remove(&identifier.id) {
                    conn.close();
                }
                debug!(peer = %identifier.id, "Remote peer disposed");
            }
        }
        Ok(())
    }

    fn on_redirect(&self, ctx: &MessageContext, redirect: RedirectEnvelope) -> Result<()> {
        if !self.from_hub(ctx.connection()) {
            return Err(spoofed(RedirectEnvelope::TYPE_KEY));
        }
        if is_control_plane(&redirect.inner_type_key) {
            return Err(spoofed(&redirect.inner_type_key));
        }
        let sender = redirect.sender;
        ctx.connection().deliver(redirect.into_inner(), Some(sender));
        Ok(())
    }

    fn on_offer(self: &Arc<Self>, ctx: &MessageContext, offer: PeerServerNegotiation) -> Result<()> {
        if !self.from_hub(ctx.connection()) {
            return Err(spoofed(PeerServerNegotiation::TYPE_KEY));
        }
        if offer.shutdown {
            self.offers
                .lock()
                .retain(|queued| !(queued.requester == offer.requester && queued.port == offer.port));
            return Ok(());
        }
        if offer.serializer != self.serializer() {
            return Err(ProtocolError::SerializationError(format!(
                "peer {} offers serializer '{}', local is '{}'",
                offer.requester,
                offer.serializer,
                self.serializer()
            )));
        }

        if self.p2p.auto_accept {
            let client = PeerClient {
                state: Arc::clone(self),
            };
            tokio::spawn(async move {
                if let Err(e) = client.accept(&offer).await {
                    warn!(peer = %offer.requester, host = %offer.host, port = offer.port, error = %e, "Direct dial failed, relay stays in use");
                }
            });
        } else {
            debug!(peer = %offer.requester, "Direct-link offer queued");
            self.offers.lock().push(offer);
        }
        Ok(())
    }

    fn on_routing_failure(&self, ctx: &MessageContext, failure: RoutingFailure) -> Result<()> {
        if !self.from_hub(ctx.connection()) {
            return Err(spoofed(RoutingFailure::TYPE_KEY));
        }
        self.endpoint.registry().metrics().routing_failure();
        Err(ProtocolError::RoutingError(format!(
            "{} for {} to {}",
            failure.reason, failure.type_key, failure.recipient
        )))
    }

    fn on_disconnect(&self, conn: &Connection) {
        match conn.remote_peer() {
            Some(peer) => {
                if self
                    .direct
                    .remove_if(&peer, |_, existing| existing.id() == conn.id())
                    .is_some()
                {
                    info!(%peer, "Direct link closed");
                }
            }
            None if self.from_hub(conn) => warn!(conn = conn.id(), "Hub connection lost"),
            None => {}
        }
    }
}

fn install(dispatcher: &Dispatcher, state: &Arc<PeerState>) {
    let weak: Weak<PeerState> = Arc::downgrade(state);

    dispatcher.register::<Identifier, _>({
        let weak = weak.clone();
        move |ctx, identifier| match weak.upgrade() {
            Some(state) => state.on_identifier(ctx, identifier),
            None => Ok(()),
        }
    });
    dispatcher.register::<RedirectEnvelope, _>({
        let weak = weak.clone();
        move |ctx, redirect| match weak.upgrade() {
            Some(state) => state.on_redirect(ctx, redirect),
            None => Ok(()),
        }
    });
    dispatcher.register::<PeerServerNegotiation, _>({
        let weak = weak.clone();
        move |ctx, offer| match weak.upgrade() {
            Some(state) => state.on_offer(ctx, offer),
            None => Ok(()),
        }
    });
    dispatcher.register::<RoutingFailure, _>({
        let weak = weak.clone();
        move |ctx, failure| match weak.upgrade() {
            Some(state) => state.on_routing_failure(ctx, failure),
            None => Ok(()),
        }
    });
    dispatcher.on_disconnect(move |conn| {
        if let Some(state) = weak.upgrade() {
            state.on_disconnect(conn);
        }
    });
}

impl PeerClient {
    /// Dial the hub at `config.client.address`; a `ws://` address selects
    /// WebSocket.
    pub async fn connect(config: &NetworkConfig) -> Result<Self> {
        config.validate_strict()?;
        let endpoint = Endpoint::from_config(config)?;
        Self::connect_with(endpoint, config.p2p.clone(), &config.client.address).await
    }

    /// Dial the hub with a prepared endpoint. Handlers already registered on
    /// its dispatcher see the very first messages.
    pub async fn connect_with(endpoint: Endpoint, p2p: P2pConfig, hub_addr: &str) -> Result<Self> {
        let (identity, _) = watch::channel(None);
        let state = Arc::new(PeerState {
            endpoint: endpoint.clone(),
            p2p,
            hub: OnceLock::new(),
            identity,
            remotes: PeerDirectory::new(),
            direct: DashMap::new(),
            offers: Mutex::new(Vec::new()),
        });
        install(endpoint.dispatcher(), &state);

        let hub = if hub_addr.starts_with("ws://") || hub_addr.starts_with("wss://") {
            endpoint.connect_websocket(hub_addr).await?
        } else {
            endpoint.connect(hub_addr).await?
        };
        let _ = state.hub.set(hub);
        Ok(Self { state })
    }

    /// Wait until the hub has assigned this peer its identity.
    pub async fn wait_for_identity(&self, timeout: Duration) -> Result<PeerIdentity> {
        let mut rx = self.state.identity.subscribe();
        let assigned = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        (*assigned)
            .clone()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_IDENTITY_PENDING.to_string()))
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.state.local_id()
    }

    pub fn local_identity(&self) -> Option<PeerIdentity> {
        self.state.identity.borrow().clone()
    }

    pub fn remote_peers(&self) -> Vec<PeerIdentity> {
        self.state.remotes.snapshot()
    }

    pub fn remote_peer(&self, peer: PeerId) -> Option<PeerIdentity> {
        self.state.remotes.get(peer)
    }

    pub fn hub_connection(&self) -> Option<Connection> {
        self.state.hub.get().cloned()
    }

    pub fn direct_connection(&self, peer: PeerId) -> Option<Connection> {
        self.state.direct.get(&peer).map(|entry| entry.value().clone())
    }

    pub fn direct_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.state.direct.iter().map(|entry| *entry.key()).collect();
        peers.sort_unstable();
        peers
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.state.endpoint.dispatcher()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.state.endpoint.registry()
    }

    /// Offers received while `auto_accept` is off.
    pub fn take_offers(&self) -> Vec<PeerServerNegotiation> {
        std::mem::take(&mut *self.state.offers.lock())
    }

    /// Send to the hub itself.
    pub fn send<T: Wire>(&self, object: &T) -> Result<()> {
        self.state.hub()?.send(object)
    }

    /// Send to another peer, directly when linked and through the hub
    /// otherwise.
    pub fn send_to<T: Wire>(&self, peer: PeerId, object: &T) -> Result<Route> {
        if is_control_plane(T::TYPE_KEY) {
            return Err(spoofed(T::TYPE_KEY));
        }
        if let Some(conn) = self.direct_connection(peer).filter(Connection::is_open) {
            conn.send(object)?;
            return Ok(Route::Direct);
        }
        self.state.hub()?.send(&RedirectEnvelope::wrap(peer, object))?;
        Ok(Route::Relayed)
    }

    /// Open a listener for `target` and offer it through the hub.
    ///
    /// Returns the bound port. The listener adopts the first dialer that
    /// presents the offer's token within the negotiation timeout and then
    /// retires.
    pub async fn start_server(&self, target: PeerId) -> Result<u16> {
        let p2p = &self.state.p2p;
        if !p2p.enabled {
            return Err(ProtocolError::ConfigError(constants::ERR_P2P_DISABLED.to_string()));
        }
        let local = self
            .local_id()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_IDENTITY_PENDING.to_string()))?;
        let host: IpAddr = p2p
            .bind_host
            .parse()
            .map_err(|_| ProtocolError::ConfigError(format!("invalid P2P bind host '{}'", p2p.bind_host)))?;

        let (listener, port) = bind_in_range(host, p2p.port_range_start..=p2p.port_range_end).await?;
        let token = rand::random::<u64>();
        let offer = PeerServerNegotiation {
            host: p2p.advertise_host.clone(),
            port,
            requester: local,
            target,
            serializer: self.state.serializer().to_string(),
            shutdown: false,
            token,
        };
        self.send(&offer)?;
        info!(%target, port, "Offered direct link");

        let state = Arc::clone(&self.state);
        let deadline = tokio::time::Instant::now() + p2p.negotiation_timeout;
        tokio::spawn(async move {
            // Keep accepting until a dialer proves it is the target.
            loop {
                let (stream, remote) = match tokio::time::timeout_at(deadline, listener.accept()).await {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        warn!(%target, port, error = %e, "Direct listener failed");
                        break;
                    }
                    Err(_) => {
                        warn!(%target, port, "No direct dial within negotiation window");
                        break;
                    }
                };
                let _ = stream.set_nodelay(true);
                match tokio::time::timeout_at(deadline, state.endpoint.adopt_peer(stream, target, token)).await {
                    Ok(Ok(conn)) => {
                        state.link(target, conn);
                        break;
                    }
                    Ok(Err(e)) => warn!(%target, %remote, error = %e, "Direct dial refused"),
                    Err(_) => {
                        warn!(%target, %remote, "Direct dial did not identify itself in time");
                        break;
                    }
                }
            }
            drop(listener);
            if let Ok(hub) = state.hub() {
                let _ = hub.send(&offer.retired());
            }
        });
        Ok(port)
    }

    /// Dial the listener described by `offer` and keep the link under the
    /// requester's id.
    pub async fn accept(&self, offer: &PeerServerNegotiation) -> Result<Connection> {
        if offer.serializer != self.state.serializer() {
            return Err(ProtocolError::SerializationError(format!(
                "serializer mismatch: '{}' vs '{}'",
                offer.serializer,
                self.state.serializer()
            )));
        }
        let ip: IpAddr = offer
            .host
            .parse()
            .map_err(|_| ProtocolError::TransportError(format!("invalid offer host '{}'", offer.host)))?;
        let addr = SocketAddr::new(ip, offer.port).to_string();

        let conn = self
            .state
            .endpoint
            .connect_peer(&addr, offer.requester, offer.token)
            .await?;
        self.state.link(offer.requester, conn.clone());
        Ok(conn)
    }

    /// Close the direct links and the hub connection.
    pub fn close(&self) {
        let links: Vec<Connection> = self
            .state
            .direct
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in links {
            conn.close();
        }
        if let Some(hub) = self.state.hub.get() {
            hub.close();
        }
    }
}
