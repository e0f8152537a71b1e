//! Splitting blobs into chunks and putting them back together.
//!
//! `final_num_chunks = ceil(len / chunk_size)`; every chunk but the last is
//! exactly `chunk_size` bytes. A chunk message with no bytes and index `-1`
//! is the delete signal for its resource.

use super::ResourceId;
use crate::protocol::{CheckpointChunk, Event};

/// Chunk index of the delete signal on the wire.
pub const DELETE_CHUNK_ID: i64 = -1;

/// Largest `final_num_chunks` a resource may announce. Receivers allocate
/// one slot per chunk up front.
pub const MAX_CHUNKS: u64 = 1 << 20;

/// One slice of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: u64,
    pub data: &'a [u8],
    pub final_num_chunks: u64,
}

/// Split `blob` into `chunk_size` slices, in index order.
pub fn split(blob: &[u8], chunk_size: usize) -> Result<impl ExactSizeIterator<Item = Chunk<'_>>, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::ZeroChunkSize);
    }
    let final_num_chunks = blob.len().div_ceil(chunk_size) as u64;
    Ok(blob
        .chunks(chunk_size)
        .enumerate()
        .map(move |(index, data)| Chunk {
            index: index as u64,
            data,
            final_num_chunks,
        }))
}

/// Concatenate fully populated slots in index order.
pub fn reassemble(slots: &[Option<Vec<u8>>]) -> Result<Vec<u8>, CodecError> {
    let mut total = 0;
    for (index, slot) in slots.iter().enumerate() {
        match slot {
            Some(bytes) => total += bytes.len(),
            None => return Err(CodecError::MissingChunk(index as u64)),
        }
    }

    let mut blob = Vec::with_capacity(total);
    for bytes in slots.iter().flatten() {
        blob.extend_from_slice(bytes);
    }
    Ok(blob)
}

/// A validated checkpoint chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkMessage {
    Data {
        id: ResourceId,
        index: u64,
        bytes: Vec<u8>,
        final_num_chunks: u64,
    },
    Delete {
        id: ResourceId,
    },
}

impl ChunkMessage {
    pub fn id(&self) -> &ResourceId {
        match self {
            ChunkMessage::Data { id, .. } | ChunkMessage::Delete { id } => id,
        }
    }

    /// Classify a wire payload as data chunk or delete signal.
    pub fn from_payload(chunk: CheckpointChunk) -> Result<Self, CodecError> {
        let id = ResourceId::of_chunk(&chunk);
        match (chunk.chunk_id, chunk.chunk_data) {
            (DELETE_CHUNK_ID, None) => Ok(ChunkMessage::Delete { id }),
            (DELETE_CHUNK_ID, Some(_)) => Err(CodecError::DeleteWithData(id)),
            (index, Some(bytes)) if index >= 0 => Ok(ChunkMessage::Data {
                id,
                index: index as u64,
                bytes,
                final_num_chunks: chunk.final_num_chunks,
            }),
            (index, None) if index >= 0 => Err(CodecError::MissingChunkData { id, index }),
            (index, _) => Err(CodecError::InvalidChunkIndex { id, index }),
        }
    }

    pub fn into_payload(self) -> CheckpointChunk {
        let (id, chunk_data, chunk_id, final_num_chunks) = match self {
            ChunkMessage::Data {
                id,
                index,
                bytes,
                final_num_chunks,
            } => (id, Some(bytes), index as i64, final_num_chunks),
            ChunkMessage::Delete { id } => (id, None, DELETE_CHUNK_ID, 0),
        };
        CheckpointChunk {
            room_id: id.run_group_id,
            experiment_id: id.experiment_id,
            checkpoint_id: id.checkpoint_id,
            entity_id: id.resource_name,
            chunk_data,
            chunk_id,
            final_num_chunks,
        }
    }
}

/// Build the `checkpoint` events that transfer `blob` as resource `id`.
///
/// An empty blob has no chunks, so a receiver could never observe it; it is
/// rejected instead of silently publishing nothing.
pub fn checkpoint_events(id: &ResourceId, blob: &[u8], chunk_size: usize) -> Result<Vec<Event>, CodecError> {
    if blob.is_empty() {
        return Err(CodecError::EmptyBlob(id.clone()));
    }
    let chunks = split(blob, chunk_size)?;
    if chunks.len() as u64 > MAX_CHUNKS {
        return Err(CodecError::TooManyChunks {
            id: id.clone(),
            final_num_chunks: chunks.len() as u64,
        });
    }
    Ok(chunks
        .map(|chunk| {
            let message = ChunkMessage::Data {
                id: id.clone(),
                index: chunk.index,
                bytes: chunk.data.to_vec(),
                final_num_chunks: chunk.final_num_chunks,
            };
            Event::checkpoint(message.into_payload())
        })
        .collect())
}

/// Build the delete signal for resource `id`.
pub fn delete_event(id: &ResourceId) -> Event {
    Event::checkpoint(ChunkMessage::Delete { id: id.clone() }.into_payload())
}

/// Chunk codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("chunk size must be positive")]
    ZeroChunkSize,
    #[error("chunk {0} is missing")]
    MissingChunk(u64),
    #[error("checkpoint resource {0} is empty")]
    EmptyBlob(ResourceId),
    #[error("delete signal for {0} carries data")]
    DeleteWithData(ResourceId),
    #[error("chunk {index} of {id} carries no data")]
    MissingChunkData { id: ResourceId, index: i64 },
    #[error("invalid chunk index {index} for {id}")]
    InvalidChunkIndex { id: ResourceId, index: i64 },
    #[error("checkpoint resource {id} would need {final_num_chunks} chunks, more than {MAX_CHUNKS}")]
    TooManyChunks { id: ResourceId, final_num_chunks: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_split_10000_bytes() {
        let data = blob(10_000);
        let chunks: Vec<Chunk> = split(&data, 4096).unwrap().collect();

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.final_num_chunks == 3));
        let lengths: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(lengths, vec![4096, 4096, 1808]);
        let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_split_exact_multiple() {
        let data = blob(8192);
        let chunks: Vec<Chunk> = split(&data, 4096).unwrap().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].data.len(), 4096);
        assert_eq!(chunks[0].final_num_chunks, 2);
    }

    #[test]
    fn test_split_smaller_than_chunk() {
        let data = blob(10);
        let chunks: Vec<Chunk> = split(&data, 4096).unwrap().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, &data[..]);
    }

    #[test]
    fn test_split_empty_and_zero_size() {
        assert_eq!(split(&[], 16).unwrap().len(), 0);
        assert!(matches!(split(&[1, 2, 3], 0), Err(CodecError::ZeroChunkSize)));
    }

    #[test]
    fn test_reassemble_concatenates_in_order() {
        let slots = vec![Some(vec![1, 2]), Some(vec![3]), Some(vec![4, 5, 6])];
        assert_eq!(reassemble(&slots).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_reassemble_missing_chunk() {
        let slots = vec![Some(vec![1]), None, Some(vec![3])];
        assert_eq!(reassemble(&slots), Err(CodecError::MissingChunk(1)));
    }

    #[test]
    fn test_split_reassemble_identity() {
        let data = blob(10_000);
        let slots: Vec<Option<Vec<u8>>> = split(&data, 777).unwrap().map(|c| Some(c.data.to_vec())).collect();
        assert_eq!(reassemble(&slots).unwrap(), data);
    }

    #[test]
    fn test_checkpoint_events_payloads() {
        let id = ResourceId::new("gs-1", 3, 7, "model");
        let events = checkpoint_events(&id, &blob(10), 4).unwrap();
        assert_eq!(events.len(), 3);

        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.room_id(), "gs-1");
            let chunk = event.as_checkpoint().unwrap();
            assert_eq!(chunk.chunk_id, i as i64);
            assert_eq!(chunk.final_num_chunks, 3);
            assert_eq!(chunk.entity_id, "model");
        }
        assert_eq!(events[2].as_checkpoint().unwrap().chunk_data.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_checkpoint_events_rejects_empty_blob() {
        let id = ResourceId::new("gs-1", 3, 7, "model");
        assert_eq!(checkpoint_events(&id, &[], 4), Err(CodecError::EmptyBlob(id)));
    }

    #[test]
    fn test_checkpoint_events_rejects_too_many_chunks() {
        let id = ResourceId::new("gs-1", 3, 7, "model");
        let data = vec![0u8; MAX_CHUNKS as usize + 1];
        assert_eq!(
            checkpoint_events(&id, &data, 1),
            Err(CodecError::TooManyChunks {
                id: id.clone(),
                final_num_chunks: MAX_CHUNKS + 1,
            })
        );
    }

    #[test]
    fn test_delete_signal_shape() {
        let id = ResourceId::new("gs-1", 3, 7, "model");
        let event = delete_event(&id);
        let chunk = event.as_checkpoint().unwrap().clone();
        assert_eq!(chunk.chunk_id, -1);
        assert_eq!(chunk.chunk_data, None);

        assert_eq!(ChunkMessage::from_payload(chunk).unwrap(), ChunkMessage::Delete { id });
    }

    #[test]
    fn test_from_payload_rejects_inconsistent_chunks() {
        let id = ResourceId::new("gs-1", 3, 7, "model");
        let mut chunk = ChunkMessage::Delete { id: id.clone() }.into_payload();

        chunk.chunk_data = Some(vec![1]);
        assert_eq!(
            ChunkMessage::from_payload(chunk.clone()),
            Err(CodecError::DeleteWithData(id.clone()))
        );

        chunk.chunk_id = 2;
        chunk.chunk_data = None;
        assert!(matches!(
            ChunkMessage::from_payload(chunk.clone()),
            Err(CodecError::MissingChunkData { index: 2, .. })
        ));

        chunk.chunk_id = -5;
        assert!(matches!(
            ChunkMessage::from_payload(chunk),
            Err(CodecError::InvalidChunkIndex { index: -5, .. })
        ));
    }
}
