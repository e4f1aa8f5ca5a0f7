//! Hub identity exchange, relay and direct-link negotiation over loopback

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use peerwire::config::P2pConfig;
use peerwire::core::gate::TypeGate;
use peerwire::core::value::Value;
use peerwire::error::ProtocolError;
use peerwire::protocol::{Dispatcher, PeerId, PeerServerNegotiation, RedirectEnvelope};
use peerwire::service::{Hub, PeerClient, Route};
use peerwire::transport::{ConnectionOptions, Endpoint, Registry, TransportKind};
use peerwire::wire_struct;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Chat = "app.Chat" {
        pub text: String,
    }
}

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    client: PeerClient,
    id: PeerId,
    chats: UnboundedReceiver<(Option<PeerId>, Chat)>,
    errors: UnboundedReceiver<String>,
}

fn p2p(ports: (u16, u16), auto_accept: bool) -> P2pConfig {
    P2pConfig {
        enabled: true,
        bind_host: "127.0.0.1".to_string(),
        port_range_start: ports.0,
        port_range_end: ports.1,
        negotiation_timeout: Duration::from_secs(3),
        auto_accept,
        ..P2pConfig::default()
    }
}

async fn hub(kind: TransportKind) -> Hub {
    let endpoint = Endpoint::new(
        Registry::new(),
        ConnectionOptions::default(),
        Arc::new(Dispatcher::new()),
    );
    Hub::start(endpoint, "127.0.0.1:0", kind).await.unwrap()
}

async fn join_at(addr: &str, p2p: P2pConfig) -> Node {
    let dispatcher = Arc::new(Dispatcher::new());
    let (chat_tx, chats) = unbounded_channel();
    let (err_tx, errors) = unbounded_channel();
    dispatcher.register::<Chat, _>(move |ctx, chat| {
        let _ = chat_tx.send((ctx.sender(), chat));
        Ok(())
    });
    dispatcher.on_error(move |_conn, e| {
        let _ = err_tx.send(e.to_string());
    });

    let options =
        ConnectionOptions::default().with_gate(TypeGate::with_control_plane().allow_type::<Chat>());
    let endpoint = Endpoint::new(Registry::new(), options, dispatcher);
    let client = PeerClient::connect_with(endpoint, p2p, addr).await.unwrap();
    let id = client.wait_for_identity(WAIT).await.unwrap().id;
    Node {
        client,
        id,
        chats,
        errors,
    }
}

async fn join(hub: &Hub, p2p: P2pConfig) -> Node {
    join_at(&hub.local_addr().to_string(), p2p).await
}

async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn next_chat(rx: &mut UnboundedReceiver<(Option<PeerId>, Chat)>) -> (Option<PeerId>, Chat) {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for chat")
        .expect("chat channel closed")
}

async fn next_error(rx: &mut UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for error")
        .expect("error channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identity_exchange() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, P2pConfig::default()).await;
    let b = join(&hub, P2pConfig::default()).await;

    assert_ne!(a.id, b.id);
    let local = a.client.local_identity().unwrap();
    assert_eq!(local.ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    assert!(eventually(|| a.client.remote_peer(b.id).is_some()).await);
    assert!(eventually(|| b.client.remote_peer(a.id).is_some()).await);
    // Remote mirrors never carry the address.
    assert_eq!(a.client.remote_peer(b.id).unwrap().ip, None);
    assert!(eventually(|| hub.peers().len() == 2).await);
    assert!(hub.connection(a.id).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identity_exchange_over_websocket() {
    let hub = hub(TransportKind::WebSocket).await;
    let addr = format!("ws://{}", hub.local_addr());
    let a = join_at(&addr, P2pConfig::default()).await;
    let b = join_at(&addr, P2pConfig::default()).await;

    assert!(eventually(|| a.client.remote_peer(b.id).is_some()).await);
    assert!(eventually(|| b.client.remote_peer(a.id).is_some()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_public_metadata_broadcast() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, P2pConfig::default()).await;
    let b = join(&hub, P2pConfig::default()).await;
    assert!(eventually(|| b.client.remote_peer(a.id).is_some()).await);

    hub.set_metadata(a.id, "nick", Some("alice".into())).unwrap();

    let nick = |identity: Option<peerwire::protocol::PeerIdentity>| {
        identity.and_then(|i| i.public_metadata.get("nick").cloned())
    };
    assert!(eventually(|| nick(b.client.remote_peer(a.id)).as_deref() == Some("alice")).await);
    assert!(eventually(|| nick(a.client.local_identity()).as_deref() == Some("alice")).await);

    // Only the owner's copy carries its address.
    assert!(a.client.local_identity().unwrap().ip.is_some());
    assert_eq!(b.client.remote_peer(a.id).unwrap().ip, None);

    hub.set_metadata(a.id, "nick", None).unwrap();
    assert!(eventually(|| nick(b.client.remote_peer(a.id)).is_none()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_private_metadata_stays_on_hub() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, P2pConfig::default()).await;
    let b = join(&hub, P2pConfig::default()).await;
    assert!(eventually(|| b.client.remote_peer(a.id).is_some()).await);

    hub.set_private_metadata(a.id, "token", Some("s3cret".into())).unwrap();
    hub.set_metadata(a.id, "nick", Some("alice".into())).unwrap();
    assert!(eventually(|| {
        b.client
            .remote_peer(a.id)
            .is_some_and(|i| i.public_metadata.contains_key("nick"))
    })
    .await);

    assert_eq!(
        hub.peer(a.id).unwrap().private_metadata.get("token").map(String::as_str),
        Some("s3cret")
    );
    let mirror = b.client.remote_peer(a.id).unwrap();
    assert!(mirror.private_metadata.is_empty());
    assert!(!mirror.public_metadata.contains_key("token"));
    assert!(!a.client.local_identity().unwrap().public_metadata.contains_key("token"));

    assert!(matches!(
        hub.set_private_metadata(PeerId(999_999), "k", Some("v".into())),
        Err(ProtocolError::RoutingError(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departure_disposes_mirrors() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, P2pConfig::default()).await;
    let b = join(&hub, P2pConfig::default()).await;
    assert!(eventually(|| a.client.remote_peer(b.id).is_some()).await);

    b.client.close();
    assert!(eventually(|| a.client.remote_peer(b.id).is_none()).await);
    assert!(eventually(|| hub.peers().len() == 1).await);
    assert!(hub.connection(b.id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_stamps_sender() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, P2pConfig::default()).await;
    let mut b = join(&hub, P2pConfig::default()).await;

    let route = a
        .client
        .send_to(b.id, &Chat {
            text: "via hub".into(),
        })
        .unwrap();
    assert_eq!(route, Route::Relayed);

    let (sender, chat) = next_chat(&mut b.chats).await;
    assert_eq!(sender, Some(a.id));
    assert_eq!(chat.text, "via hub");
    assert!(eventually(|| hub.registry().metrics().snapshot().relays_forwarded == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_to_unknown_peer_reports_routing_failure() {
    let hub = hub(TransportKind::Tcp).await;
    let mut a = join(&hub, P2pConfig::default()).await;

    let route = a.client.send_to(PeerId(999_999), &Chat::default()).unwrap();
    assert_eq!(route, Route::Relayed);

    let err = next_error(&mut a.errors).await;
    assert!(err.contains("Routing error") && err.contains("recipient unreachable"), "{err}");
    assert!(a.client.hub_connection().unwrap().is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_control_plane_types_never_relayed() {
    let hub = hub(TransportKind::Tcp).await;
    let mut a = join(&hub, P2pConfig::default()).await;
    let mut b = join(&hub, P2pConfig::default()).await;

    assert!(matches!(
        a.client.send_to(b.id, &PeerServerNegotiation::default()),
        Err(ProtocolError::TypeNotAllowed {
            blacklisted: true,
            ..
        })
    ));

    // Hand-built envelope bypassing the client-side check.
    let forged = RedirectEnvelope {
        sender: b.id,
        recipient: b.id,
        inner_type_key: "peer.Identifier".to_string(),
        inner_payload: Value::Null,
    };
    a.client.send(&forged).unwrap();

    let err = next_error(&mut a.errors).await;
    assert!(err.contains("control-plane"), "{err}");
    assert!(eventually(|| b.client.remote_peer(a.id).is_some()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.errors.try_recv().is_err());
    assert_eq!(b.client.local_id(), Some(b.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_link_with_auto_accept() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, p2p((47100, 47149), true)).await;
    let mut b = join(&hub, p2p((47150, 47199), true)).await;

    let port = a.client.start_server(b.id).await.unwrap();
    assert!((47100..=47149).contains(&port));

    assert!(eventually(|| a.client.direct_connection(b.id).is_some()).await);
    assert!(eventually(|| b.client.direct_connection(a.id).is_some()).await);
    assert_eq!(b.client.direct_peers(), vec![a.id]);

    let route = a
        .client
        .send_to(b.id, &Chat {
            text: "direct".into(),
        })
        .unwrap();
    assert_eq!(route, Route::Direct);
    let (sender, chat) = next_chat(&mut b.chats).await;
    assert_eq!(sender, Some(a.id));
    assert_eq!(chat.text, "direct");

    // The listener retires once its single peer has dialed in.
    assert!(eventually(|| !hub.is_direct_host(a.id)).await);
    assert_eq!(hub.registry().metrics().snapshot().relays_forwarded, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manual_accept_and_host_tracking() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, p2p((47200, 47249), false)).await;
    let b = join(&hub, p2p((47250, 47299), false)).await;

    let port = a.client.start_server(b.id).await.unwrap();
    assert!(eventually(|| hub.is_direct_host(a.id)).await);

    let mut offers = Vec::new();
    assert!(eventually(|| {
        offers.extend(b.client.take_offers());
        !offers.is_empty()
    })
    .await);
    let offer = offers.remove(0);
    assert_eq!(offer.port, port);
    assert_eq!(offer.requester, a.id);
    assert_eq!(offer.host, "127.0.0.1");

    let link = b.client.accept(&offer).await.unwrap();
    assert_eq!(link.remote_peer(), Some(a.id));
    assert!(eventually(|| a.client.direct_connection(b.id).is_some()).await);
    assert!(eventually(|| !hub.is_direct_host(a.id)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_listener_requires_link_token() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, p2p((47600, 47649), false)).await;
    let mut b = join(&hub, p2p((47650, 47699), false)).await;

    let port = a.client.start_server(b.id).await.unwrap();
    let mut offers = Vec::new();
    assert!(eventually(|| {
        offers.extend(b.client.take_offers());
        !offers.is_empty()
    })
    .await);
    let offer = offers.remove(0);

    // Knows the port, not the token.
    let stranger = Endpoint::new(
        Registry::new(),
        ConnectionOptions::default(),
        Arc::new(Dispatcher::new()),
    );
    let forged = stranger
        .connect_peer(&format!("127.0.0.1:{port}"), a.id, offer.token.wrapping_add(1))
        .await
        .unwrap();
    assert!(eventually(|| !forged.is_open()).await);
    assert!(a.client.direct_connection(b.id).is_none());

    // The listener is still waiting for the real target.
    let link = b.client.accept(&offer).await.unwrap();
    assert!(eventually(|| a.client.direct_connection(b.id).is_some()).await);
    let route = a
        .client
        .send_to(b.id, &Chat {
            text: "verified".into(),
        })
        .unwrap();
    assert_eq!(route, Route::Direct);
    let (sender, chat) = next_chat(&mut b.chats).await;
    assert_eq!(sender, Some(a.id));
    assert_eq!(chat.text, "verified");
    assert!(link.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_dial_falls_back_to_relay() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, p2p((47300, 47349), false)).await;
    let mut b = join(&hub, p2p((47350, 47399), false)).await;

    // Nothing listens on the offered port.
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);
    let offer = PeerServerNegotiation {
        host: "127.0.0.1".into(),
        port: dead_port,
        requester: b.id,
        target: a.id,
        serializer: "json".into(),
        shutdown: false,
        token: 1,
    };
    assert!(a.client.accept(&offer).await.is_err());
    assert!(a.client.direct_connection(b.id).is_none());

    let route = a
        .client
        .send_to(b.id, &Chat {
            text: "fallback".into(),
        })
        .unwrap();
    assert_eq!(route, Route::Relayed);
    assert_eq!(next_chat(&mut b.chats).await.1.text, "fallback");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serializer_mismatch_refused() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, p2p((47400, 47449), false)).await;

    let offer = PeerServerNegotiation {
        host: "127.0.0.1".into(),
        port: 47401,
        requester: PeerId(1),
        target: a.id,
        serializer: "msgpack".into(),
        shutdown: false,
        token: 1,
    };
    assert!(matches!(
        a.client.accept(&offer).await,
        Err(ProtocolError::SerializationError(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_start_server_requires_p2p_enabled() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, P2pConfig::default()).await;
    let b = join(&hub, P2pConfig::default()).await;

    assert!(matches!(
        a.client.start_server(b.id).await,
        Err(ProtocolError::ConfigError(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hub_shutdown_closes_peers() {
    let hub = hub(TransportKind::Tcp).await;
    let a = join(&hub, P2pConfig::default()).await;

    hub.shutdown();
    let conn = a.client.hub_connection().unwrap();
    assert!(eventually(|| conn.is_closed()).await);
    assert!(matches!(
        a.client.send(&Chat::default()),
        Err(ProtocolError::ConnectionClosed)
    ));
}
