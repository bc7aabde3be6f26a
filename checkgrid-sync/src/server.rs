//! WebSocket sync server for the shared grid.
//!
//! Architecture:
//! ```text
//! Observer A ──┐ "i:b"                                   ┌──► Observer A
//!              ├──► IngestHandle ──► Batcher ──► BitStore │
//! Observer B ──┘    (bounded mpsc)     │                  ├──► Observer B
//!                                      ├── PersistenceGateway (BlobStore)
//!                                      └── BroadcastHub ──┘
//! ```
//!
//! Each connection:
//! - completes the WebSocket handshake within `handshake_timeout`
//! - registers an observer with the hub
//! - receives the full state as its first frame
//! - gets a delivery task that drains its queue into the socket
//! - feeds parsed mutations into the ingest queue
//!
//! On disconnect the observer is unregistered; no other connection is
//! affected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::batcher::{Batcher, BatcherConfig, IngestCounters, IngestError, IngestHandle};
use crate::bitvec::{BitVector, BitVectorError, Update};
use crate::broadcast::{run_delivery, BroadcastHub, ObserverError, ObserverHandle, ObserverSink};
use crate::config::{ConfigError, ServerConfig};
use crate::protocol::{ClientMessage, Notification, ProtocolError};
use crate::storage::{BlobStore, PersistenceError, PersistenceGateway};
use crate::store::BitStore;
use crate::transfer::FullStateFrame;

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("stored state does not fit the configured vector: {0}")]
    Vector(#[from] BitVectorError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Well-formed mutations received
    pub total_messages: u64,
    /// Frames that failed to parse
    pub malformed_messages: u64,
    pub resync_requests: u64,
    pub batches_flushed: u64,
    pub mutations_applied: u64,
    pub mutations_rejected: u64,
    pub persistence_failures: u64,
    pub notifications_dropped: u64,
    pub observers: usize,
}

/// Connection-level counters; the rest of [`ServerStats`] is read live.
#[derive(Debug, Default)]
struct ConnectionStats {
    total_connections: u64,
    active_connections: u64,
    total_messages: u64,
    malformed_messages: u64,
    resync_requests: u64,
}

/// Everything a connection task needs.
///
/// The ingest handle is only cloned out of `ingest` once the handshake is
/// done, so a half-open socket never holds the queue open.
#[derive(Clone)]
struct ConnectionContext {
    store: Arc<BitStore>,
    hub: Arc<BroadcastHub>,
    ingest: Arc<RwLock<Option<IngestHandle>>>,
    stats: Arc<RwLock<ConnectionStats>>,
    shutdown: watch::Receiver<bool>,
    handshake_timeout: Duration,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    store: Arc<BitStore>,
    hub: Arc<BroadcastHub>,
    gateway: PersistenceGateway,
    /// Taken on shutdown so the batcher sees the queue close
    ingest: Arc<RwLock<Option<IngestHandle>>>,
    ingest_counters: Arc<IngestCounters>,
    batcher: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ConnectionStats>>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Load or initialize the grid state and start the batcher.
    ///
    /// A missing blob is initialized to all-false and saved. Any other load
    /// failure, or a blob of the wrong size, is returned.
    pub async fn start(config: ServerConfig, blobs: Arc<dyn BlobStore>) -> Result<Self, ServerError> {
        config.validate()?;
        let gateway = PersistenceGateway::new(blobs, config.state_key.clone());

        let store = match gateway.load().await? {
            Some(bytes) => {
                let bits = BitVector::from_bytes(config.vector_size, &bytes)?;
                log::info!(
                    "Loaded state '{}' ({} cells, {} set)",
                    gateway.key(),
                    bits.len(),
                    bits.count_ones()
                );
                BitStore::from_vector(bits)
            }
            None => {
                let store = BitStore::new(config.vector_size);
                gateway.save(store.save_to().await).await?;
                log::info!(
                    "Initialized empty state '{}' ({} cells)",
                    gateway.key(),
                    config.vector_size
                );
                store
            }
        };

        let store = Arc::new(store);
        let hub = Arc::new(BroadcastHub::new(config.observer_queue_capacity));
        let batcher_config = BatcherConfig {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        };
        let (ingest, batcher) = Batcher::new(
            batcher_config,
            config.ingest_queue_capacity,
            store.clone(),
            gateway.clone(),
            hub.clone(),
        );
        let ingest_counters = ingest.counters();
        let batcher = tokio::spawn(batcher.run());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            hub,
            gateway,
            ingest: Arc::new(RwLock::new(Some(ingest))),
            ingest_counters,
            batcher: Mutex::new(Some(batcher)),
            stats: Arc::new(RwLock::new(ConnectionStats::default())),
            shutdown,
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept WebSocket connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = stopped(&mut shutdown) => break,
            };
            log::debug!("New TCP connection from {addr}");

            let ctx = ConnectionContext {
                store: self.store.clone(),
                hub: self.hub.clone(),
                ingest: self.ingest.clone(),
                stats: self.stats.clone(),
                shutdown: self.shutdown.subscribe(),
                handshake_timeout: self.config.handshake_timeout,
            };

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }

        log::info!("Sync server stopped accepting connections");
        Ok(())
    }

    /// Queue a mutation as if it arrived from an observer.
    pub async fn submit(&self, update: Update) -> Result<(), ServerError> {
        let ingest = self.ingest.read().await.clone().ok_or(IngestError::Closed)?;
        ingest.submit(update).await?;
        Ok(())
    }

    /// Stop accepting, close every connection and wait for the batcher to
    /// flush what is pending.
    pub async fn shutdown(&self) {
        log::info!("Sync server shutting down");
        self.shutdown.send_replace(true);
        self.ingest.write().await.take();

        if let Some(batcher) = self.batcher.lock().await.take() {
            if let Err(e) = batcher.await {
                log::error!("Batcher task failed: {e}");
            }
        }
    }

    /// Full-state frame of the current grid.
    pub async fn full_state(&self) -> FullStateFrame {
        full_state_frame(&self.store).await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let conn = self.stats.read().await;
        let ingest = self.ingest_counters.snapshot();
        let hub = self.hub.stats().await;
        ServerStats {
            total_connections: conn.total_connections,
            active_connections: conn.active_connections,
            total_messages: conn.total_messages,
            malformed_messages: conn.malformed_messages,
            resync_requests: conn.resync_requests,
            batches_flushed: ingest.batches_flushed,
            mutations_applied: ingest.mutations_applied,
            mutations_rejected: ingest.mutations_rejected,
            persistence_failures: ingest.persistence_failures,
            notifications_dropped: hub.dropped,
            observers: hub.observers,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BitStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }
}

/// Resolves once shutdown is signalled or the server is dropped.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn full_state_frame(store: &BitStore) -> FullStateFrame {
    FullStateFrame::from_words(store.len(), &store.snapshot().await)
}

/// Queue the current full state for one observer.
///
/// The frame is queued while the store's read guard is held. A flush that
/// lands later publishes after the frame; one that landed earlier is
/// already in it, and replaying its updates leaves the replica unchanged.
async fn send_full_state(ctx: &ConnectionContext, handle: ObserverHandle) {
    let bits = ctx.store.read().await;
    let frame = FullStateFrame::from_words(bits.len(), bits.words());
    let notification = match Notification::full_state(&frame) {
        Ok(notification) => notification,
        Err(e) => {
            log::error!("Failed to encode full state for {handle}: {e}");
            return;
        }
    };
    let queued = ctx.hub.send_to(handle, notification).await;
    drop(bits);

    match queued {
        Ok(()) => {}
        Err(ObserverError::QueueFull(_)) => {
            log::warn!("Observer {handle} queue full, full state dropped");
        }
        Err(e) => log::debug!("Full state for {handle} not queued: {e}"),
    }
}

/// Writes notifications to the outbound half of a WebSocket.
struct WebSocketSink<S> {
    inner: S,
}

impl<S> ObserverSink for WebSocketSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    async fn deliver(&mut self, notification: &Notification) -> Result<(), ObserverError> {
        for message in notification.to_messages() {
            self.inner
                .feed(message)
                .await
                .map_err(|e| ObserverError::Write(e.to_string()))?;
        }
        self.inner
            .flush()
            .await
            .map_err(|e| ObserverError::Write(e.to_string()))
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
) -> Result<(), ServerError> {
    let mut shutdown = ctx.shutdown.clone();
    let ws_stream = tokio::select! {
        accepted = tokio::time::timeout(
            ctx.handshake_timeout,
            tokio_tungstenite::accept_async(stream),
        ) => match accepted {
            Ok(ws_stream) => ws_stream?,
            Err(_) => {
                log::warn!("WebSocket handshake from {addr} timed out");
                return Ok(());
            }
        },
        _ = stopped(&mut shutdown) => {
            log::debug!("Dropping handshake from {addr} for shutdown");
            return Ok(());
        }
    };
    let Some(ingest) = ctx.ingest.read().await.clone() else {
        log::debug!("Server shutting down, refusing {addr}");
        return Ok(());
    };
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let observer = ctx.hub.register().await;
    let handle = observer.handle();
    send_full_state(&ctx, handle).await;

    let delivery = tokio::spawn(run_delivery(
        ctx.hub.clone(),
        observer,
        WebSocketSink { inner: ws_sender },
    ));

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = stopped(&mut shutdown) => {
                log::debug!("Closing connection from {addr} for shutdown");
                break;
            }
        };

        let parsed = match msg {
            Some(Ok(Message::Text(text))) => ClientMessage::parse_text(text.as_str()),
            Some(Ok(Message::Binary(data))) => ClientMessage::parse_binary(&data),
            Some(Ok(Message::Close(_))) | None => {
                log::info!("Connection closed from {addr}");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::warn!("WebSocket error from {addr}: {e}");
                break;
            }
        };

        match parsed {
            Ok(ClientMessage::Update(update)) => {
                ctx.stats.write().await.total_messages += 1;
                if ingest.submit(update).await.is_err() {
                    log::debug!("Ingest closed, dropping connection from {addr}");
                    break;
                }
            }
            Ok(ClientMessage::Resync) => {
                ctx.stats.write().await.resync_requests += 1;
                log::debug!("Resync requested by {addr}");
                send_full_state(&ctx, handle).await;
            }
            Err(e) => {
                ctx.stats.write().await.malformed_messages += 1;
                log::warn!("Dropping malformed frame from {addr}: {e}");
            }
        }
    }

    // Cleanup: the observer leaves, nobody else notices
    ctx.hub.unregister(handle).await;
    delivery.abort();
    ctx.stats.write().await.active_connections -= 1;

    Ok(())
}
