//! # mlgym-stream: telemetry streaming backbone for training jobs
//!
//! Streams status, metric and checkpoint events from training workers to
//! live dashboards over WebSocket. Events are grouped into rooms (one per run
//! group), stored per room, and replayed to anyone who joins late.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   mlgym_event    ┌──────────────┐   batch + live   ┌───────────────┐
//! │ MonitorClient │ ───────────────► │ StreamServer │ ───────────────► │ MonitorClient │
//! │ (worker)      │    WebSocket     │              │    WebSocket     │ (dashboard)   │
//! └───────────────┘                  └──────┬───────┘                  └───────┬───────┘
//!                                           │                                  │
//!                                           ▼                                  ▼
//!                                    ┌─────────────┐                   ┌─────────────────┐
//!                                    │ Hub         │                   │ CheckpointCache │
//!                                    │ rooms +     │                   │ (reassembly)    │
//!                                    │ sessions    │                   └─────────────────┘
//!                                    └──────┬──────┘
//!                              ┌────────────┴────────────┐
//!                              ▼                         ▼
//!                     ┌────────────────┐        ┌────────────────┐
//!                     │ StoreRegistry  │        │ BroadcastGroup │
//!                     │ memory / JSONL │        │ (per room)     │
//!                     └────────────────┘        └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON channel messages and typed events
//! - [`storage`]: append-only per-room event stores
//! - [`broadcast`]: per-room live fan-out
//! - [`hub`]: rooms, sessions, replay-on-join
//! - [`checkpoint`]: chunked checkpoint transfer and reassembly
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with offline queue

pub mod broadcast;
pub mod checkpoint;
pub mod client;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, MemberInfo};
pub use checkpoint::{
    CheckpointCache, CheckpointEntityError, Chunk, ChunkMessage, CodecError, ResourceId, TransferState,
};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, MonitorClient, OfflineQueue, RoomCursors};
pub use hub::{Hub, HubConfig, HubError, HubStats, Session};
pub use protocol::{
    CheckpointChunk, ClientMessage, EvaluationResult, Event, EventBody, EventRecord, EventType, ExperimentConfig,
    ExperimentStatus, JobStatus, ProtocolError, RawEvent, ServerMessage, SessionId,
};
pub use server::{ServerConfig, ServerStats, StreamServer};
pub use storage::{EventStore, FileStore, MemoryStore, StorageConfig, StoreError, StoreRegistry};
