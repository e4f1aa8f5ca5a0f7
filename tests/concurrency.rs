#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peerwire::core::codec::EnvelopeCodec;
use peerwire::core::envelope::Envelope;
use peerwire::core::frame::HEADER_LEN;
use peerwire::core::gate::TypeGate;
use peerwire::protocol::Dispatcher;
use peerwire::transport::{ConnectionOptions, Endpoint, Registry};
use peerwire::wire_struct;
use tokio::task::JoinSet;

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Tick = "load.Tick" {
        pub client: u32,
        pub seq: u32,
        pub body: Vec<u8>,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_encode_decode_heavy() {
    let iterations = 5_000u32;
    let payload_sizes = [0usize, 64, 512, 4096, 65536];
    let codec = Arc::new(EnvelopeCodec::default());
    let gate = Arc::new(TypeGate::new().allow_type::<Tick>());

    let mut tasks = JoinSet::new();
    for (client, &size) in payload_sizes.iter().enumerate() {
        let codec = Arc::clone(&codec);
        let gate = Arc::clone(&gate);
        tasks.spawn(async move {
            for seq in 0..iterations {
                let tick = Tick {
                    client: client as u32,
                    seq,
                    body: vec![((seq as usize + size) & 0xFF) as u8; size],
                };
                let frame = codec.encode(&Envelope::wrap(&tick)).unwrap();
                let envelope = codec.decode(&frame[HEADER_LEN..]).unwrap();
                let (decoded, _) = envelope.unwrap::<Tick>(&gate).unwrap();
                assert_eq!(decoded, tick);
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_clients_keep_per_connection_order() {
    const CLIENTS: u32 = 16;
    const PER_CLIENT: u32 = 200;

    let seen: Arc<parking_lot::Mutex<HashMap<u32, Vec<u32>>>> = Arc::default();
    let dispatcher = Arc::new(Dispatcher::new());
    {
        let seen = Arc::clone(&seen);
        dispatcher.register::<Tick, _>(move |_ctx, tick| {
            seen.lock().entry(tick.client).or_default().push(tick.seq);
            Ok(())
        });
    }
    let options =
        ConnectionOptions::default().with_gate(TypeGate::with_control_plane().allow_type::<Tick>());
    let server = Endpoint::new(Registry::new(), options, dispatcher);
    let listener = server.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().to_string();

    // All clients share one registry and so one set of workers.
    let client_endpoint = Endpoint::new(
        Registry::new(),
        ConnectionOptions::default(),
        Arc::new(Dispatcher::new()),
    );
    let mut tasks = JoinSet::new();
    for client in 0..CLIENTS {
        let endpoint = client_endpoint.clone();
        let addr = addr.clone();
        tasks.spawn(async move {
            let conn = endpoint.connect(&addr).await.unwrap();
            for seq in 0..PER_CLIENT {
                conn.send(&Tick {
                    client,
                    seq,
                    body: vec![0; 32],
                })
                .unwrap();
            }
            conn.flush(Duration::from_secs(10)).await.unwrap();
            conn
        });
    }
    let mut connections = Vec::new();
    while let Some(res) = tasks.join_next().await {
        connections.push(res.unwrap());
    }
    assert_eq!(client_endpoint.registry().client_count(), CLIENTS as usize);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let total: usize = seen.lock().values().map(Vec::len).sum();
        if total == (CLIENTS * PER_CLIENT) as usize || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), CLIENTS as usize);
    let expected: Vec<u32> = (0..PER_CLIENT).collect();
    for (client, order) in seen.iter() {
        assert_eq!(order, &expected, "client {client} out of order");
    }
    drop(seen);

    for conn in connections {
        conn.close();
    }
}
