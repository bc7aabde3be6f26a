//! Wire protocol between observers and the server.
//!
//! Inbound (observer → server):
//! ```text
//! text   "<index>:<bool>"               one mutation
//! text   {"index": <u64>, "value": b}   one mutation (JSON form)
//! text   "resync"                       request a full-state frame
//! binary bincode(Update)                one mutation
//! ```
//!
//! Outbound (server → observer):
//! ```text
//! text   "<index>:<bool>"               one applied update
//! text   {"bitsetRLE": "...", ...}      full-state frame
//! ```

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;

use crate::bitvec::Update;
use crate::transfer::{FullStateFrame, TransferError};

const RESYNC: &str = "resync";

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message format: {0:?}")]
    InvalidFormat(String),
    #[error("invalid index: {0:?}")]
    InvalidIndex(String),
    #[error("invalid value: {0:?}")]
    InvalidValue(String),
    #[error("invalid JSON update: {0}")]
    Json(String),
    #[error("invalid binary update: {0}")]
    Binary(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// A message sent by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    Update(Update),
    Resync,
}

impl ClientMessage {
    pub fn parse_text(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(RESYNC) {
            return Ok(Self::Resync);
        }
        if text.starts_with('{') {
            let update: Update =
                serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;
            return Ok(Self::Update(update));
        }
        parse_update(text).map(Self::Update)
    }

    pub fn parse_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_update_binary(bytes).map(Self::Update)
    }

    pub fn to_message(&self) -> Message {
        match self {
            Self::Update(update) => Message::Text(encode_update(update).into()),
            Self::Resync => Message::Text(RESYNC.to_string().into()),
        }
    }
}

/// A message sent by the server, as parsed by an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Update(Update),
    FullState(FullStateFrame),
}

impl ServerMessage {
    pub fn parse_text(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim();
        if text.starts_with('{') {
            return Ok(Self::FullState(FullStateFrame::from_json(text)?));
        }
        parse_update(text).map(Self::Update)
    }
}

/// What the hub fans out to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Updates applied by one flush, in application order.
    Updates(Arc<[Update]>),
    /// A serialized [`FullStateFrame`].
    FullState(Arc<str>),
}

impl Notification {
    pub fn updates(updates: Vec<Update>) -> Self {
        Self::Updates(updates.into())
    }

    pub fn full_state(frame: &FullStateFrame) -> Result<Self, ProtocolError> {
        Ok(Self::FullState(frame.to_json()?.into()))
    }

    /// WebSocket frames for this notification, in send order.
    pub fn to_messages(&self) -> Vec<Message> {
        match self {
            Self::Updates(updates) => updates
                .iter()
                .map(|u| Message::Text(encode_update(u).into()))
                .collect(),
            Self::FullState(json) => vec![Message::Text(json.to_string().into())],
        }
    }
}

/// Text form `"<index>:<bool>"`.
pub fn encode_update(update: &Update) -> String {
    format!("{}:{}", update.index, update.value)
}

pub fn parse_update(text: &str) -> Result<Update, ProtocolError> {
    let (index, value) = text
        .split_once(':')
        .ok_or_else(|| ProtocolError::InvalidFormat(text.to_string()))?;
    if value.contains(':') {
        return Err(ProtocolError::InvalidFormat(text.to_string()));
    }
    let index = index
        .trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidIndex(index.to_string()))?;
    let value = parse_bool(value.trim())?;
    Ok(Update::new(index, value))
}

fn parse_bool(text: &str) -> Result<bool, ProtocolError> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ProtocolError::InvalidValue(text.to_string())),
    }
}

/// Binary form: bincode-encoded [`Update`].
pub fn encode_update_binary(update: &Update) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(update, bincode::config::standard())
        .map_err(|e| ProtocolError::Binary(e.to_string()))
}

pub fn decode_update_binary(bytes: &[u8]) -> Result<Update, ProtocolError> {
    let (update, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Binary(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Binary(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(update)
}
