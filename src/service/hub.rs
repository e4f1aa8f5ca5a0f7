//! # Hub
//!
//! The server side of the peer layer. Every accepted connection becomes a
//! peer whose id equals the connection id. The hub:
//!
//! - exchanges `Identifier` messages on join and announces departures
//! - owns public and private metadata and broadcasts public changes
//! - relays [`RedirectEnvelope`]s between peers without reconstructing them
//! - forwards direct-link offers and tracks which peers are hosting one
//!
//! ```rust,no_run
//! use peerwire::config::NetworkConfig;
//! use peerwire::service::hub::Hub;
//!
//! # async fn run() -> peerwire::error::Result<()> {
//! let hub = Hub::bind(&NetworkConfig::default()).await?;
//! println!("hub on {}", hub.local_addr());
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::core::wire::Wire;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, MessageContext};
use crate::protocol::identity::{apply_metadata, IdentityAction, PeerDirectory, PeerId, PeerIdentity};
use crate::protocol::negotiation::{is_control_plane, PeerServerNegotiation, RedirectEnvelope, RoutingFailure};
use crate::transport::connection::{Connection, Role};
use crate::transport::endpoint::{Endpoint, Listener};
use crate::transport::registry::Registry;
use crate::transport::stream::TransportKind;

/// A forwarded offer; `live` clears when the requester retires it.
#[derive(Debug, Clone)]
struct NegotiationRecord {
    requester: PeerId,
    target: PeerId,
    port: u16,
    live: bool,
}

struct HubState {
    endpoint: Endpoint,
    directory: PeerDirectory,
    connections: DashMap<PeerId, Connection>,
    negotiations: Mutex<Vec<NegotiationRecord>>,
    /// Serializes joins, departures and metadata broadcasts.
    membership: Mutex<()>,
}

pub struct Hub {
    state: Arc<HubState>,
    listener: Listener,
}

fn peer_of(conn: &Connection) -> PeerId {
    PeerId(conn.id())
}

impl HubState {
    fn connection(&self, peer: PeerId) -> Option<Connection> {
        self.connections.get(&peer).map(|entry| entry.value().clone())
    }

    fn members(&self) -> Vec<(PeerId, Connection)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn join(&self, conn: &Connection) {
        if conn.role() != Role::Server {
            return;
        }
        let _membership = self.membership.lock();
        let peer = peer_of(conn);
        let identity = PeerIdentity::new(peer, Some(conn.remote_addr().ip()));

        if let Err(e) = conn.send(&identity.identifier(IdentityAction::LocalIdentity, true)) {
            warn!(%peer, error = %e, "Failed to send local identity");
            return;
        }
        let announce = identity.identifier(IdentityAction::RemoteIdentity, false);
        for (other, other_conn) in self.members() {
            let _ = other_conn.send(&announce);
            if let Some(existing) = self.directory.get(other) {
                let _ = conn.send(&existing.identifier(IdentityAction::RemoteIdentity, false));
            }
        }

        self.directory.insert(identity);
        self.connections.insert(peer, conn.clone());
        info!(%peer, peers = self.connections.len(), "Peer joined");
    }

    fn leave(&self, conn: &Connection) {
        let peer = peer_of(conn);
        let _membership = self.membership.lock();
        let removed = self
            .connections
            .remove_if(&peer, |_, existing| existing.id() == conn.id())
            .is_some();
        if !removed {
            return;
        }

        self.negotiations
            .lock()
            .retain(|record| record.requester != peer && record.target != peer);

        if let Some(identity) = self.directory.remove(peer) {
            let dispose = identity.identifier(IdentityAction::Dispose, false);
            for (_, other_conn) in self.members() {
                let _ = other_conn.send(&dispose);
            }
        }
        info!(%peer, peers = self.connections.len(), "Peer left");
    }

    fn routing_failure(&self, ctx: &MessageContext, failure: RoutingFailure) -> ProtocolError {
        self.endpoint.registry().metrics().routing_failure();
        let error = ProtocolError::RoutingError(format!(
            "{} for {} to {}",
            failure.reason, failure.type_key, failure.recipient
        ));
        if let Err(e) = ctx.reply(&failure) {
            debug!(error = %e, "Could not report routing failure to sender");
        }
        error
    }

    fn relay(&self, ctx: &MessageContext, mut redirect: RedirectEnvelope) -> Result<()> {
        redirect.sender = peer_of(ctx.connection());

        if is_control_plane(&redirect.inner_type_key) {
            let _ = ctx.reply(&RoutingFailure {
                recipient: redirect.recipient,
                type_key: redirect.inner_type_key.clone(),
                reason: "control-plane type cannot be relayed".to_string(),
            });
            return Err(ProtocolError::TypeNotAllowed {
                type_key: redirect.inner_type_key,
                blacklisted: true,
            });
        }

        let forwarded = self
            .connection(redirect.recipient)
            .map(|target| target.send(&redirect));
        match forwarded {
            Some(Ok(())) => {
                self.endpoint.registry().metrics().relay_forwarded();
                debug!(sender = %redirect.sender, recipient = %redirect.recipient, type_key = %redirect.inner_type_key, "Relayed");
                Ok(())
            }
            Some(Err(_)) | None => Err(self.routing_failure(
                ctx,
                RoutingFailure {
                    recipient: redirect.recipient,
                    type_key: redirect.inner_type_key,
                    reason: "recipient unreachable".to_string(),
                },
            )),
        }
    }

    fn negotiate(&self, ctx: &MessageContext, mut offer: PeerServerNegotiation) -> Result<()> {
        let conn = ctx.connection();
        offer.requester = peer_of(conn);
        if offer.host.is_empty() {
            offer.host = conn.remote_addr().ip().to_string();
        }

        if offer.shutdown {
            for record in self.negotiations.lock().iter_mut() {
                if record.requester == offer.requester
                    && record.target == offer.target
                    && record.port == offer.port
                {
                    record.live = false;
                }
            }
            debug!(requester = %offer.requester, port = offer.port, "Direct listener retired");
            return Ok(());
        }

        let delivered = self
            .connection(offer.target)
            .map(|target| target.send(&offer));
        match delivered {
            Some(Ok(())) => {
                self.negotiations.lock().push(NegotiationRecord {
                    requester: offer.requester,
                    target: offer.target,
                    port: offer.port,
                    live: true,
                });
                info!(requester = %offer.requester, target = %offer.target, host = %offer.host, port = offer.port, "Forwarded direct-link offer");
                Ok(())
            }
            Some(Err(_)) | None => Err(self.routing_failure(
                ctx,
                RoutingFailure {
                    recipient: offer.target,
                    type_key: PeerServerNegotiation::TYPE_KEY.to_string(),
                    reason: "target unreachable".to_string(),
                },
            )),
        }
    }
}

impl Hub {
    /// Listen on `config.server.address` over TCP.
    pub async fn bind(config: &NetworkConfig) -> Result<Self> {
        config.validate_strict()?;
        let endpoint = Endpoint::from_config(config)?;
        Self::start(endpoint, &config.server.address, TransportKind::Tcp).await
    }

    /// Install the hub handlers on `endpoint` and start listening.
    pub async fn start(endpoint: Endpoint, addr: &str, kind: TransportKind) -> Result<Self> {
        let state = Arc::new(HubState {
            endpoint: endpoint.clone(),
            directory: PeerDirectory::new(),
            connections: DashMap::new(),
            negotiations: Mutex::new(Vec::new()),
            membership: Mutex::new(()),
        });
        install(endpoint.dispatcher(), &state);

        let listener = match kind {
            TransportKind::Tcp => endpoint.listen(addr).await?,
            TransportKind::WebSocket => endpoint.listen_websocket(addr).await?,
        };
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.state.endpoint.dispatcher()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.state.endpoint.registry()
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.state.directory.snapshot()
    }

    /// The hub's record of `peer`, private metadata included.
    pub fn peer(&self, peer: PeerId) -> Option<PeerIdentity> {
        self.state.directory.get(peer)
    }

    pub fn connection(&self, peer: PeerId) -> Option<Connection> {
        self.state.connection(peer)
    }

    /// True while `peer` hosts a direct listener it has not retired.
    pub fn is_direct_host(&self, peer: PeerId) -> bool {
        self.state
            .negotiations
            .lock()
            .iter()
            .any(|record| record.requester == peer && record.live)
    }

    /// Set or remove (`None`/empty) a public metadata key and broadcast the
    /// updated identity to every peer.
    pub fn set_metadata(&self, peer: PeerId, key: &str, value: Option<String>) -> Result<()> {
        let _membership = self.state.membership.lock();
        let updated = self
            .state
            .directory
            .update(peer, |identity| apply_metadata(&mut identity.public_metadata, key, value))
            .ok_or_else(|| ProtocolError::RoutingError(format!("unknown peer {peer}")))?;

        for (other, conn) in self.state.members() {
            let identifier = updated.identifier(IdentityAction::MetadataUpdate, other == peer);
            if let Err(e) = conn.send(&identifier) {
                debug!(peer = %other, error = %e, "Metadata update not delivered");
            }
        }
        debug!(%peer, key, "Public metadata changed");
        Ok(())
    }

    /// Set or remove a private metadata key. Never leaves the hub.
    pub fn set_private_metadata(&self, peer: PeerId, key: &str, value: Option<String>) -> Result<()> {
        self.state
            .directory
            .update(peer, |identity| apply_metadata(&mut identity.private_metadata, key, value))
            .map(|_| ())
            .ok_or_else(|| ProtocolError::RoutingError(format!("unknown peer {peer}")))
    }

    pub fn send_to<T: Wire>(&self, peer: PeerId, object: &T) -> Result<()> {
        self.state
            .connection(peer)
            .ok_or_else(|| ProtocolError::RoutingError(format!("unknown peer {peer}")))?
            .send(object)
    }

    /// Send to every peer; returns how many accepted the object.
    pub fn broadcast<T: Wire>(&self, object: &T) -> usize {
        self.state
            .members()
            .into_iter()
            .filter(|(_, conn)| conn.send(object).is_ok())
            .count()
    }

    /// Stop accepting and close every peer connection.
    pub fn shutdown(&self) {
        self.listener.shutdown();
        for (_, conn) in self.state.members() {
            conn.close();
        }
        info!("Hub shut down");
    }
}

fn install(dispatcher: &Dispatcher, state: &Arc<HubState>) {
    let weak: Weak<HubState> = Arc::downgrade(state);
    dispatcher.on_connect({
        let weak = weak.clone();
        move |conn| {
            if let Some(state) = weak.upgrade() {
                state.join(conn);
            }
        }
    });
    dispatcher.on_disconnect({
        let weak = weak.clone();
        move |conn| {
            if let Some(state) = weak.upgrade() {
                state.leave(conn);
            }
        }
    });
    dispatcher.register::<RedirectEnvelope, _>({
        let weak = weak.clone();
        move |ctx, redirect| match weak.upgrade() {
            Some(state) => state.relay(ctx, redirect),
            None => Ok(()),
        }
    });
    dispatcher.register::<PeerServerNegotiation, _>(move |ctx, offer| match weak.upgrade() {
        Some(state) => state.negotiate(ctx, offer),
        None => Ok(()),
    });
}
