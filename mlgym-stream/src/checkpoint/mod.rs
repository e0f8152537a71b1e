//! Chunked transfer of checkpoint resources.
//!
//! ```text
//! publisher                                  receiver
//! ─────────                                  ────────
//! blob ── split() ──► chunk events ──► hub ──► CheckpointCache.add_chunk × N
//!                                                   │  all slots filled
//!                                                   ▼
//!                                             reassemble() ──► blob
//! ```
//!
//! A resource is named by [`ResourceId`]. Its transfer state is derived from
//! the receiver's slot array and is never stored on its own.

pub mod cache;
pub mod codec;

use std::fmt;

use crate::protocol::CheckpointChunk;

pub use cache::{CheckpointCache, CheckpointEntityError};
pub use codec::{
    checkpoint_events, delete_event, reassemble, split, Chunk, ChunkMessage, CodecError, MAX_CHUNKS,
};

/// Names one binary artifact, e.g. the model weights of epoch 7 of
/// experiment 3 in run group `gs-1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub run_group_id: String,
    pub experiment_id: u64,
    pub checkpoint_id: u64,
    pub resource_name: String,
}

impl ResourceId {
    pub fn new(
        run_group_id: impl Into<String>,
        experiment_id: u64,
        checkpoint_id: u64,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            run_group_id: run_group_id.into(),
            experiment_id,
            checkpoint_id,
            resource_name: resource_name.into(),
        }
    }

    /// Identity carried by a checkpoint chunk payload.
    pub fn of_chunk(chunk: &CheckpointChunk) -> Self {
        Self::new(
            chunk.room_id.clone(),
            chunk.experiment_id,
            chunk.checkpoint_id,
            chunk.entity_id.clone(),
        )
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.run_group_id, self.experiment_id, self.checkpoint_id, self.resource_name
        )
    }
}

/// Progress of one resource on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// At least one chunk is still missing
    Transferring,
    /// Every chunk has arrived
    Transferred,
    /// The chunks were dropped on request
    Deleted,
}

impl TransferState {
    /// Derive the state from a slot array; `None` means the slots were cleared.
    pub fn of_slots(slots: Option<&[Option<Vec<u8>>]>) -> Self {
        match slots {
            None => TransferState::Deleted,
            Some(slots) if slots.iter().all(Option::is_some) => TransferState::Transferred,
            Some(_) => TransferState::Transferring,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferState::Transferring => "TRANSFERRING",
            TransferState::Transferred => "TRANSFERRED",
            TransferState::Deleted => "DELETED",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_of_slots() {
        let partial = vec![Some(vec![1]), None];
        let full = vec![Some(vec![1]), Some(vec![])];

        assert_eq!(TransferState::of_slots(Some(&partial)), TransferState::Transferring);
        assert_eq!(TransferState::of_slots(Some(&full)), TransferState::Transferred);
        assert_eq!(TransferState::of_slots(None), TransferState::Deleted);
    }

    #[test]
    fn test_resource_id_display() {
        let id = ResourceId::new("gs-1", 3, 7, "model");
        assert_eq!(id.to_string(), "gs-1/3/7/model");
    }

    #[test]
    fn test_resource_id_of_chunk() {
        let chunk = CheckpointChunk {
            room_id: "gs-1".to_string(),
            experiment_id: 3,
            checkpoint_id: 7,
            entity_id: "optimizer".to_string(),
            chunk_data: None,
            chunk_id: -1,
            final_num_chunks: 0,
        };
        assert_eq!(ResourceId::of_chunk(&chunk), ResourceId::new("gs-1", 3, 7, "optimizer"));
    }
}
