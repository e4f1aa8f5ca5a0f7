//! Example: Hub relay and direct peer links
//!
//! Starts a hub and two peers in one process. Alice first reaches Bob
//! through the hub, then opens a direct listener and talks to him without
//! the relay.
//!
//! Run with: `cargo run --example relay_chat`

#![allow(clippy::uninlined_format_args)]

use std::time::Duration;

use peerwire::config::NetworkConfig;
use peerwire::service::{Hub, PeerClient};
use peerwire::transport::Endpoint;
use peerwire::utils::logging::init_logging;
use peerwire::wire_struct;

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Chat = "demo.Chat" {
        pub text: String,
    }
}

async fn peer(config: &NetworkConfig, name: &'static str) -> peerwire::Result<PeerClient> {
    let endpoint = Endpoint::from_config(config)?;
    endpoint.dispatcher().register::<Chat, _>(move |ctx, chat| {
        let from = ctx
            .sender()
            .map_or_else(|| "hub".to_string(), |id| id.to_string());
        println!("[{name}] {from}: {}", chat.text);
        Ok(())
    });
    endpoint.dispatcher().on_error(move |_conn, e| {
        eprintln!("[{name}] error: {e}");
    });
    PeerClient::connect_with(endpoint, config.p2p.clone(), &config.client.address).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "relay-chat".to_string();
    let _log_guard = init_logging(&config.logging)?;

    config.server.address = "127.0.0.1:0".to_string();
    config.security.allowed_types = vec!["demo.Chat".to_string()];
    config.p2p.enabled = true;
    config.p2p.bind_host = "127.0.0.1".to_string();

    let hub = Hub::bind(&config).await?;
    config.client.address = hub.local_addr().to_string();
    println!("Hub listening on {}", hub.local_addr());

    let alice = peer(&config, "alice").await?;
    let bob = peer(&config, "bob").await?;
    let alice_id = alice.wait_for_identity(Duration::from_secs(5)).await?.id;
    let bob_id = bob.wait_for_identity(Duration::from_secs(5)).await?.id;
    println!("alice = {}, bob = {}", alice_id, bob_id);

    hub.set_metadata(alice_id, "nick", Some("alice".to_string()))?;

    let route = alice.send_to(bob_id, &Chat {
        text: "hello through the hub".to_string(),
    })?;
    println!("first message went {:?}", route);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let port = alice.start_server(bob_id).await?;
    println!("alice offered a direct listener on port {}", port);
    while alice.direct_connection(bob_id).is_none() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let route = alice.send_to(bob_id, &Chat {
        text: "hello directly".to_string(),
    })?;
    println!("second message went {:?}", route);
    tokio::time::sleep(Duration::from_millis(200)).await;

    if let Some(mirror) = bob.remote_peer(alice_id) {
        println!("bob sees alice's metadata: {:?}", mirror.public_metadata);
    }

    hub.registry().metrics().log_metrics();
    alice.close();
    bob.close();
    hub.shutdown();
    Ok(())
}
