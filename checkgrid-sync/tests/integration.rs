//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real observers,
//! verifying the full mutation → flush → broadcast pipeline.

use checkgrid_sync::client::{ConnectionState, ObserverClient, ObserverEvent};
use checkgrid_sync::config::ServerConfig;
use checkgrid_sync::protocol::{encode_update_binary, ServerMessage};
use checkgrid_sync::server::SyncServer;
use checkgrid_sync::storage::MemoryBlobStore;
use checkgrid_sync::Update;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

const SIZE: u64 = 256;

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        vector_size: SIZE,
        flush_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    }
}

/// Start a server on a free port, return it with its URL.
async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, String) {
    let server = Arc::new(
        SyncServer::start(config, Arc::new(MemoryBlobStore::new()))
            .await
            .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let s = server.clone();
    tokio::spawn(async move {
        s.serve(listener).await.unwrap();
    });
    (server, url)
}

/// Poll `check` until it holds or five seconds pass.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next text frame from a raw socket, parsed.
async fn next_server_message<S>(ws: &mut S) -> ServerMessage
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no frame in time")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return ServerMessage::parse_text(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_first_frame_is_full_state() {
    let (server, url) = start_test_server(test_config()).await;
    server.store().set(17, true).await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    match next_server_message(&mut ws).await {
        ServerMessage::FullState(frame) => {
            assert_eq!(frame.size, SIZE);
            let bits = frame.to_vector().unwrap();
            assert!(bits.get(17).unwrap());
            assert_eq!(bits.count_ones(), 1);
        }
        other => panic!("Expected full state, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_connects_and_receives_state() {
    let (_server, url) = start_test_server(test_config()).await;

    let mut client = ObserverClient::new(&url, SIZE);
    let mut events = client.take_event_rx().unwrap();
    client.open().await.unwrap();

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(ObserverEvent::Connected)
    );
    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(ObserverEvent::FullState { size: SIZE, ones: 0 })
    );
}

#[tokio::test]
async fn test_two_observers_converge() {
    let (server, url) = start_test_server(test_config()).await;

    let alice = ObserverClient::connect(&url, SIZE).await.unwrap();
    let bob = ObserverClient::connect(&url, SIZE).await.unwrap();
    wait_until(|| async { server.hub().observer_count().await == 2 }).await;

    alice.send_update(5, true).await.unwrap();
    bob.send_update(200, true).await.unwrap();
    alice.send_update(5, false).await.unwrap();
    bob.send_update(42, true).await.unwrap();

    wait_until(|| async { server.stats().await.mutations_applied == 4 }).await;
    let expected = server.store().snapshot().await;

    wait_until(|| async { alice.snapshot().await == expected }).await;
    wait_until(|| async { bob.snapshot().await == expected }).await;

    assert_eq!(alice.get(5).await, Some(false));
    assert_eq!(bob.get(200).await, Some(true));
    assert_eq!(bob.count_ones().await, 2);
}

#[tokio::test]
async fn test_sender_receives_own_update() {
    let (_server, url) = start_test_server(test_config()).await;

    let mut client = ObserverClient::new(&url, SIZE);
    let mut events = client.take_event_rx().unwrap();
    client.open().await.unwrap();

    client.send_update(9, true).await.unwrap();
    let seen = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let ObserverEvent::Update(update) = event {
                return update;
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();

    assert_eq!(seen, Update::new(9, true));
    assert_eq!(client.get(9).await, Some(true));
}

#[tokio::test]
async fn test_late_joiner_sees_existing_state() {
    let (server, url) = start_test_server(test_config()).await;

    let early = ObserverClient::connect(&url, SIZE).await.unwrap();
    early.send_update(1, true).await.unwrap();
    early.send_update(255, true).await.unwrap();
    wait_until(|| async { server.store().count_ones().await == 2 }).await;

    let late = ObserverClient::connect(&url, SIZE).await.unwrap();
    wait_until(|| async { late.count_ones().await == 2 }).await;
    assert_eq!(late.get(255).await, Some(true));
}

#[tokio::test]
async fn test_resync_replaces_replica() {
    let (server, url) = start_test_server(test_config()).await;

    let mut client = ObserverClient::new(&url, SIZE);
    let mut events = client.take_event_rx().unwrap();
    client.open().await.unwrap();

    // changed behind the observers' backs: no broadcast
    server.store().set(77, true).await.unwrap();
    client.request_resync().await.unwrap();

    let full_states = timeout(Duration::from_secs(2), async {
        let mut count = 0;
        while let Some(event) = events.recv().await {
            if let ObserverEvent::FullState { .. } = event {
                count += 1;
                if count == 2 {
                    return count;
                }
            }
        }
        count
    })
    .await
    .unwrap();

    assert_eq!(full_states, 2);
    assert_eq!(client.get(77).await, Some(true));
    assert_eq!(server.stats().await.resync_requests, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_converge_when_joining_under_load() {
    const CELLS: u64 = 1 << 16;
    const WRITES: u64 = 3_000;

    let config = ServerConfig {
        vector_size: CELLS,
        observer_queue_capacity: 100_000,
        ingest_queue_capacity: 1_000,
        ..test_config()
    };
    let (server, url) = start_test_server(config).await;

    // distinct cells, so a stale full state cannot be repaired by a later write
    let writer = {
        let server = server.clone();
        tokio::spawn(async move {
            for i in 0..WRITES {
                server.submit(Update::new(i * 17 % CELLS, true)).await.unwrap();
            }
        })
    };

    let mut clients = Vec::new();
    for n in 0..12 {
        let client = ObserverClient::connect(&url, CELLS).await.unwrap();
        if n % 3 == 0 {
            client.request_resync().await.unwrap();
        }
        clients.push(client);
        sleep(Duration::from_millis(5)).await;
    }

    writer.await.unwrap();
    wait_until(|| async { server.stats().await.mutations_applied == WRITES }).await;

    let expected = server.store().snapshot().await;
    for client in &clients {
        wait_until(|| async { client.snapshot().await == expected }).await;
    }
    assert_eq!(server.store().count_ones().await, WRITES);
    assert_eq!(server.stats().await.notifications_dropped, 0);
}

#[tokio::test]
async fn test_out_of_range_rejected_others_applied() {
    let (server, url) = start_test_server(test_config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Text(format!("{SIZE}:true").into())).await.unwrap();
    ws.send(Message::Text("3:true".to_string().into())).await.unwrap();

    wait_until(|| async { server.stats().await.mutations_applied == 1 }).await;
    let stats = server.stats().await;
    assert_eq!(stats.mutations_rejected, 1);
    assert!(server.store().get(3).await.unwrap());

    // full state first, then only the applied update
    assert!(matches!(next_server_message(&mut ws).await, ServerMessage::FullState(_)));
    assert_eq!(
        next_server_message(&mut ws).await,
        ServerMessage::Update(Update::new(3, true))
    );
}

#[tokio::test]
async fn test_malformed_frames_skipped() {
    let (server, url) = start_test_server(test_config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Text("hello".to_string().into())).await.unwrap();
    ws.send(Message::Text("4:maybe".to_string().into())).await.unwrap();
    ws.send(Message::Text("4:true".to_string().into())).await.unwrap();

    wait_until(|| async { server.store().get(4).await.unwrap() }).await;
    let stats = server.stats().await;
    assert_eq!(stats.malformed_messages, 2);
    assert_eq!(stats.total_messages, 1);
    assert_eq!(stats.active_connections, 1);
}

#[tokio::test]
async fn test_json_and_binary_mutations() {
    let (server, url) = start_test_server(test_config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Text(r#"{"index": 10, "value": true}"#.to_string().into()))
        .await
        .unwrap();
    let binary = encode_update_binary(&Update::new(11, true)).unwrap();
    ws.send(Message::Binary(binary.into())).await.unwrap();

    wait_until(|| async { server.store().count_ones().await == 2 }).await;
    assert!(server.store().get(10).await.unwrap());
    assert!(server.store().get(11).await.unwrap());
}

#[tokio::test]
async fn test_disconnect_unregisters_only_that_observer() {
    let (server, url) = start_test_server(test_config()).await;

    let stays = ObserverClient::connect(&url, SIZE).await.unwrap();
    let (mut leaves, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    wait_until(|| async { server.hub().observer_count().await == 2 }).await;

    leaves.close(None).await.unwrap();
    drop(leaves);
    wait_until(|| async { server.hub().observer_count().await == 1 }).await;

    stays.send_update(0, true).await.unwrap();
    wait_until(|| async { stays.get(0).await == Some(true) }).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 1);
}

#[tokio::test]
async fn test_batched_flush_broadcasts_whole_batch() {
    let config = ServerConfig {
        batch_size: 3,
        flush_interval: Duration::from_secs(3600),
        ..test_config()
    };
    let (server, url) = start_test_server(config).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    assert!(matches!(next_server_message(&mut ws).await, ServerMessage::FullState(_)));

    for frame in ["2:true", "5:true", "2:false"] {
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    // last writer within the batch wins; every applied update is relayed in order
    assert_eq!(next_server_message(&mut ws).await, ServerMessage::Update(Update::new(2, true)));
    assert_eq!(next_server_message(&mut ws).await, ServerMessage::Update(Update::new(5, true)));
    assert_eq!(next_server_message(&mut ws).await, ServerMessage::Update(Update::new(2, false)));
    assert_eq!(server.store().snapshot().await[0], 0b0010_0000);
    assert_eq!(server.stats().await.batches_flushed, 1);
}

#[tokio::test]
async fn test_shutdown_disconnects_observers() {
    let (server, url) = start_test_server(test_config()).await;

    let mut client = ObserverClient::new(&url, SIZE);
    let mut events = client.take_event_rx().unwrap();
    client.open().await.unwrap();
    wait_until(|| async { server.hub().observer_count().await == 1 }).await;

    server.shutdown().await;

    let disconnected = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if event == ObserverEvent::Disconnected {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(disconnected);
    wait_until(|| async { client.connection_state().await == ConnectionState::Disconnected }).await;
}
