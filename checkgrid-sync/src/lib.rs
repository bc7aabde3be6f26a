//! # checkgrid-sync — shared bit-vector synchronization core
//!
//! One authoritative vector of boolean cells, mutated by many concurrent
//! observers over WebSocket and kept durable through a blob store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  "i:b" / resync   ┌────────────────┐
//! │ ObserverClient │ ────────────────► │ SyncServer     │
//! │ (replica)      │ ◄──────────────── │ (per conn)     │
//! └────────────────┘  "i:b" / full     └───────┬────────┘
//!                                              │ IngestHandle
//!                                              ▼
//!                                      ┌────────────────┐
//!                                      │ Batcher        │
//!                                      └─┬──────┬─────┬─┘
//!                                        │      │     │
//!                                        ▼      ▼     ▼
//!                                 BitStore  Gateway  BroadcastHub
//!                                 (RwLock)  (blob)   (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`rle`] — varint run-length codec over packed 64-bit words
//! - [`bitvec`] — packed bit vector and single-cell updates
//! - [`store`] — concurrent authoritative store with atomic batches
//! - [`storage`] — blob persistence (in-memory and RocksDB)
//! - [`transfer`] — base64 full-state frame
//! - [`protocol`] — text/binary wire messages
//! - [`batcher`] — mutation ingest queue and flush loop
//! - [`broadcast`] — per-observer bounded fan-out
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket observer client with a local replica
//! - [`config`] — server configuration

pub mod rle;
pub mod bitvec;
pub mod store;
pub mod storage;
pub mod transfer;
pub mod protocol;
pub mod batcher;
pub mod broadcast;
pub mod config;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use rle::CodecError;
pub use bitvec::{BitVector, BitVectorError, Update};
pub use store::{BatchOutcome, BitStore};
pub use storage::{
    BlobMetadata, BlobStore, MemoryBlobStore, PersistenceError, PersistenceGateway,
    RocksBlobStore, RocksConfig,
};
pub use transfer::{FullStateFrame, TransferError};
pub use protocol::{ClientMessage, Notification, ProtocolError, ServerMessage};
pub use batcher::{Batcher, BatcherConfig, FlushReport, IngestError, IngestHandle, IngestStats};
pub use broadcast::{
    BroadcastHub, HubStats, Observer, ObserverError, ObserverHandle, ObserverSink, PublishReport,
};
pub use config::{ConfigError, ServerConfig};
pub use server::{ServerError, ServerStats, SyncServer};
pub use client::{ClientError, ConnectionState, ObserverClient, ObserverEvent};
