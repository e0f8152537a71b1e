//! Per-room event storage.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   open(room)   ┌───────────────┐
//! │ Hub         │ ─────────────► │ StoreRegistry │
//! └─────────────┘                └───────┬───────┘
//!                                        │ one store per room
//!                        ┌───────────────┴───────────────┐
//!                        ▼                               ▼
//!                ┌──────────────┐               ┌──────────────────────────┐
//!                │ MemoryStore  │               │ FileStore                │
//!                │ (volatile)   │               │ <root>/<room>/events.jsonl│
//!                └──────────────┘               └──────────────────────────┘
//! ```
//!
//! Every store is an append-only sequence. The sequence number of an event is
//! the store length at the time it was appended: 0-based, contiguous, never
//! reused.

pub mod file;
pub mod memory;
pub mod registry;

use std::path::PathBuf;

use crate::protocol::{Event, EventRecord};

pub use file::{FileStore, LOG_FILE_NAME};
pub use memory::MemoryStore;
pub use registry::{StorageConfig, StoreRegistry};

/// A lazy, finite iterator over stored records, in append order.
pub type Replay = Box<dyn Iterator<Item = Result<EventRecord, StoreError>> + Send>;

/// Append-only event log of a single room.
///
/// Implementations must tolerate `replay` running concurrently with `append`.
/// A replay is bounded by the length observed when it was created and never
/// yields records appended afterwards.
pub trait EventStore: Send + Sync {
    /// Record `event` and return its sequence number.
    ///
    /// Either the whole event is stored or nothing is.
    fn append(&self, event: &Event) -> Result<u64, StoreError>;

    /// Records with `start <= seq < end`, where `end` is clamped to the
    /// current length.
    fn replay_range(&self, start: u64, end: u64) -> Result<Replay, StoreError>;

    /// Number of stored events.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The complete history.
    fn replay(&self) -> Result<Replay, StoreError> {
        self.replay_range(0, u64::MAX)
    }

    /// History starting at `start`.
    fn replay_from(&self, start: u64) -> Result<Replay, StoreError> {
        self.replay_range(start, u64::MAX)
    }
}

/// Room ids double as directory names, so they must be a single plain path
/// component.
pub fn validate_room_id(room_id: &str) -> Result<(), StoreError> {
    let invalid = room_id.is_empty()
        || room_id == "."
        || room_id == ".."
        || room_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidRoomId(room_id.to_string()));
    }
    Ok(())
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record {seq} in {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        seq: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid room id `{0}`")]
    InvalidRoomId(String),
}
