//! WebSocket observer client.
//!
//! Keeps a local replica of the grid:
//! - the full-state frame sent on connect (or on resync) replaces it
//! - each `"i:b"` update is applied to it in arrival order
//!
//! Mutations are sent as text; the replica only changes when the server
//! echoes them back, so every observer converges on the same state.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::bitvec::{BitVector, Update};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the observer client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    /// Connection established
    Connected,
    /// The replica was replaced by a full-state frame
    FullState { size: u64, ones: u64 },
    /// An applied update was received
    Update(Update),
    /// Connection lost
    Disconnected,
}

pub struct ObserverClient {
    /// Server URL
    url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Local copy of the grid
    replica: Arc<RwLock<BitVector>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ObserverEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ObserverEvent>,
}

impl ObserverClient {
    pub fn new(url: impl Into<String>, vector_size: u64) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            replica: Arc::new(RwLock::new(BitVector::new(vector_size))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Create a client and connect it.
    pub async fn connect(url: impl Into<String>, vector_size: u64) -> Result<Self, ClientError> {
        let mut client = Self::new(url, vector_size);
        client.open().await?;
        Ok(client)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ObserverEvent>> {
        self.event_rx.take()
    }

    /// Open the WebSocket and spawn the reader and writer tasks.
    pub async fn open(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, ObserverEvent::Connected);
        log::info!("Connected to {}", self.url);

        // Reader task: apply incoming frames to the replica
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let replica = self.replica.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::parse_text(text.as_str()) {
                        Ok(message) => {
                            if let Some(event) = apply(&replica, message).await {
                                emit(&event_tx, event);
                            }
                        }
                        Err(e) => log::warn!("Ignoring malformed server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, ObserverEvent::Disconnected);
        });

        Ok(())
    }

    /// Ask the server to set cell `index` to `value`.
    pub async fn send_update(&self, index: u64, value: bool) -> Result<(), ClientError> {
        self.send(ClientMessage::Update(Update::new(index, value))).await
    }

    /// Ask the server for a fresh full-state frame.
    pub async fn request_resync(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Resync).await
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message.to_message())
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the connection. The replica is kept.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Replica value of cell `index`; `None` when out of range.
    pub async fn get(&self, index: u64) -> Option<bool> {
        self.replica.read().await.get(index).ok()
    }

    pub async fn count_ones(&self) -> u64 {
        self.replica.read().await.count_ones()
    }

    /// Copy of the replica's packed words.
    pub async fn snapshot(&self) -> Vec<u64> {
        self.replica.read().await.words().to_vec()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Apply one server message to the replica.
async fn apply(replica: &RwLock<BitVector>, message: ServerMessage) -> Option<ObserverEvent> {
    match message {
        ServerMessage::FullState(frame) => match frame.to_vector() {
            Ok(bits) => {
                let ones = bits.count_ones();
                let size = bits.len();
                *replica.write().await = bits;
                log::debug!("Replica replaced by full state ({size} cells, {ones} set)");
                Some(ObserverEvent::FullState { size, ones })
            }
            Err(e) => {
                log::warn!("Ignoring undecodable full state: {e}");
                None
            }
        },
        ServerMessage::Update(update) => match replica.write().await.apply(update) {
            Ok(()) => Some(ObserverEvent::Update(update)),
            Err(e) => {
                log::warn!("Ignoring update outside the replica: {e}");
                None
            }
        },
    }
}

/// Events are advisory; the replica is already up to date.
fn emit(tx: &mpsc::Sender<ObserverEvent>, event: ObserverEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        log::trace!("Event queue full, dropping {event:?}");
    }
}
