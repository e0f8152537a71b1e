//! Receiver-side reassembly of chunked checkpoint resources.
//!
//! One entity per [`ResourceId`], each behind its own lock so different
//! resources fill concurrently. The slot array is allocated on the first
//! chunk with `final_num_chunks` entries and never resized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use super::codec::{self, ChunkMessage, CodecError};
use super::{ResourceId, TransferState};

struct Entity {
    /// `None` once the resource has been deleted
    slots: Option<Vec<Option<Vec<u8>>>>,
    final_num_chunks: u64,
    last_activity: Instant,
}

impl Entity {
    fn new(final_num_chunks: u64) -> Self {
        Self {
            slots: Some(vec![None; final_num_chunks as usize]),
            final_num_chunks,
            last_activity: Instant::now(),
        }
    }

    fn state(&self) -> TransferState {
        TransferState::of_slots(self.slots.as_deref())
    }
}

/// Cache of checkpoint resources being received.
pub struct CheckpointCache {
    entities: RwLock<HashMap<ResourceId, Arc<Mutex<Entity>>>>,
    /// Largest chunk count a resource may announce
    max_chunks: u64,
}

impl Default for CheckpointCache {
    fn default() -> Self {
        Self::with_max_chunks(codec::MAX_CHUNKS)
    }
}

impl CheckpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache that refuses resources announcing more than `max_chunks` chunks.
    pub fn with_max_chunks(max_chunks: u64) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            max_chunks,
        }
    }

    pub fn max_chunks(&self) -> u64 {
        self.max_chunks
    }

    /// Store chunk `index` of resource `id` and return the resulting state.
    ///
    /// A chunk that arrives again while the resource is still transferring
    /// overwrites its slot.
    pub async fn add_chunk(
        &self,
        id: &ResourceId,
        index: u64,
        bytes: Vec<u8>,
        final_num_chunks: u64,
    ) -> Result<TransferState, CheckpointEntityError> {
        if final_num_chunks == 0 {
            return Err(CheckpointEntityError::ZeroChunks(id.clone()));
        }
        if final_num_chunks > self.max_chunks {
            return Err(CheckpointEntityError::TooManyChunks {
                id: id.clone(),
                final_num_chunks,
                max: self.max_chunks,
            });
        }
        if index >= final_num_chunks {
            return Err(CheckpointEntityError::OutOfRange {
                id: id.clone(),
                index,
                final_num_chunks,
            });
        }

        let entity = self.get_or_create(id, final_num_chunks).await;
        let mut entity = entity.lock().await;

        if entity.final_num_chunks != final_num_chunks {
            return Err(CheckpointEntityError::ChunkCountMismatch {
                id: id.clone(),
                expected: entity.final_num_chunks,
                got: final_num_chunks,
            });
        }

        let state = entity.state();
        let Some(slots) = entity.slots.as_mut().filter(|_| state == TransferState::Transferring) else {
            return Err(CheckpointEntityError::NotTransferring { id: id.clone(), state });
        };
        slots[index as usize] = Some(bytes);
        entity.last_activity = Instant::now();

        let state = entity.state();
        if state == TransferState::Transferred {
            log::debug!("Checkpoint resource {id} complete ({final_num_chunks} chunks)");
        }
        Ok(state)
    }

    async fn get_or_create(&self, id: &ResourceId, final_num_chunks: u64) -> Arc<Mutex<Entity>> {
        // Fast path: read lock
        if let Some(entity) = self.entities.read().await.get(id) {
            return entity.clone();
        }

        // Slow path: write lock to create
        let mut entities = self.entities.write().await;
        // Double-check after acquiring write lock
        if let Some(entity) = entities.get(id) {
            return entity.clone();
        }

        log::trace!("Receiving checkpoint resource {id} in {final_num_chunks} chunks");
        let entity = Arc::new(Mutex::new(Entity::new(final_num_chunks)));
        entities.insert(id.clone(), entity.clone());
        entity
    }

    async fn get(&self, id: &ResourceId) -> Result<Arc<Mutex<Entity>>, CheckpointEntityError> {
        self.entities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointEntityError::UnknownEntity(id.clone()))
    }

    /// Current state of `id`, or `None` if no chunk was ever received.
    pub async fn transfer_state(&self, id: &ResourceId) -> Option<TransferState> {
        let entity = self.get(id).await.ok()?;
        let state = entity.lock().await.state();
        Some(state)
    }

    /// Release the chunks of `id`. Deleting twice is a no-op.
    pub async fn delete(&self, id: &ResourceId) -> Result<(), CheckpointEntityError> {
        let entity = self.get(id).await?;
        let mut entity = entity.lock().await;
        if entity.slots.take().is_some() {
            log::debug!("Deleted checkpoint resource {id}");
        }
        Ok(())
    }

    /// The complete blob of a fully received resource.
    pub async fn reassemble(&self, id: &ResourceId) -> Result<Vec<u8>, CheckpointEntityError> {
        let entity = self.get(id).await?;
        let entity = entity.lock().await;
        match (&entity.slots, entity.state()) {
            (Some(slots), TransferState::Transferred) => Ok(codec::reassemble(slots)?),
            (_, state) => Err(CheckpointEntityError::NotTransferred { id: id.clone(), state }),
        }
    }

    /// Route a decoded chunk message.
    pub async fn apply(&self, message: ChunkMessage) -> Result<TransferState, CheckpointEntityError> {
        match message {
            ChunkMessage::Data {
                id,
                index,
                bytes,
                final_num_chunks,
            } => self.add_chunk(&id, index, bytes, final_num_chunks).await,
            ChunkMessage::Delete { id } => {
                self.delete(&id).await?;
                Ok(TransferState::Deleted)
            }
        }
    }

    /// Forget transfers that received no chunk for longer than `max_idle`.
    ///
    /// Completed and deleted resources are kept. Returns the number evicted.
    pub async fn evict_stale(&self, max_idle: Duration) -> usize {
        let mut entities = self.entities.write().await;

        let mut stale = Vec::new();
        for (id, entity) in entities.iter() {
            let entity = entity.lock().await;
            if entity.state() == TransferState::Transferring && entity.last_activity.elapsed() > max_idle {
                stale.push(id.clone());
            }
        }

        for id in &stale {
            log::warn!("Evicting stalled checkpoint transfer {id}");
            entities.remove(id);
        }
        stale.len()
    }

    /// Number of known resources in any state.
    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

/// Checkpoint entity errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointEntityError {
    #[error("checkpoint resource {id} is {state}, chunks are only accepted while TRANSFERRING")]
    NotTransferring { id: ResourceId, state: TransferState },
    #[error("unknown checkpoint resource {0}")]
    UnknownEntity(ResourceId),
    #[error("chunk {index} out of range for {id} with {final_num_chunks} chunks")]
    OutOfRange {
        id: ResourceId,
        index: u64,
        final_num_chunks: u64,
    },
    #[error("checkpoint resource {id} has {expected} chunks, chunk announced {got}")]
    ChunkCountMismatch { id: ResourceId, expected: u64, got: u64 },
    #[error("checkpoint resource {0} announced zero chunks")]
    ZeroChunks(ResourceId),
    #[error("checkpoint resource {id} announced {final_num_chunks} chunks, limit is {max}")]
    TooManyChunks {
        id: ResourceId,
        final_num_chunks: u64,
        max: u64,
    },
    #[error("checkpoint resource {id} is {state}, not TRANSFERRED")]
    NotTransferred { id: ResourceId, state: TransferState },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::codec::split;

    fn model() -> ResourceId {
        ResourceId::new("gs-1", 0, 3, "model")
    }

    fn blob(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_reverse_order_reassembly() {
        let cache = CheckpointCache::new();
        let data = blob(10_000);
        let chunks: Vec<_> = split(&data, 4096).unwrap().collect();

        let mut states = Vec::new();
        for chunk in chunks.iter().rev() {
            let state = cache
                .add_chunk(&model(), chunk.index, chunk.data.to_vec(), chunk.final_num_chunks)
                .await
                .unwrap();
            states.push(state);
        }

        assert_eq!(
            states,
            vec![
                TransferState::Transferring,
                TransferState::Transferring,
                TransferState::Transferred
            ]
        );
        assert_eq!(cache.reassemble(&model()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_oversized_chunk_count_rejected() {
        let cache = CheckpointCache::new();
        assert_eq!(
            cache.add_chunk(&model(), 0, vec![1], u64::MAX / 2).await,
            Err(CheckpointEntityError::TooManyChunks {
                id: model(),
                final_num_chunks: u64::MAX / 2,
                max: codec::MAX_CHUNKS,
            })
        );
        assert!(cache.is_empty().await);
        assert_eq!(cache.transfer_state(&model()).await, None);

        let small = CheckpointCache::with_max_chunks(4);
        assert!(matches!(
            small.add_chunk(&model(), 0, vec![1], 5).await,
            Err(CheckpointEntityError::TooManyChunks { max: 4, .. })
        ));
        assert_eq!(
            small.add_chunk(&model(), 0, vec![1], 4).await,
            Ok(TransferState::Transferring)
        );
    }

    #[tokio::test]
    async fn test_retransmission_overwrites_slot() {
        let cache = CheckpointCache::new();
        cache.add_chunk(&model(), 0, vec![9, 9], 2).await.unwrap();
        cache.add_chunk(&model(), 0, vec![1, 2], 2).await.unwrap();
        cache.add_chunk(&model(), 1, vec![3], 2).await.unwrap();

        assert_eq!(cache.reassemble(&model()).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_chunk_after_transferred_fails() {
        let cache = CheckpointCache::new();
        cache.add_chunk(&model(), 0, vec![1], 1).await.unwrap();

        let err = cache.add_chunk(&model(), 0, vec![1], 1).await.unwrap_err();
        assert_eq!(
            err,
            CheckpointEntityError::NotTransferring {
                id: model(),
                state: TransferState::Transferred
            }
        );
    }

    #[tokio::test]
    async fn test_chunk_after_delete_fails() {
        let cache = CheckpointCache::new();
        cache.add_chunk(&model(), 0, vec![1], 2).await.unwrap();
        cache.delete(&model()).await.unwrap();
        assert_eq!(cache.transfer_state(&model()).await, Some(TransferState::Deleted));

        let err = cache.add_chunk(&model(), 1, vec![2], 2).await.unwrap_err();
        assert!(matches!(
            err,
            CheckpointEntityError::NotTransferring {
                state: TransferState::Deleted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_and_twice() {
        let cache = CheckpointCache::new();
        assert_eq!(
            cache.delete(&model()).await,
            Err(CheckpointEntityError::UnknownEntity(model()))
        );

        cache.add_chunk(&model(), 0, vec![1], 1).await.unwrap();
        cache.delete(&model()).await.unwrap();
        cache.delete(&model()).await.unwrap();
        assert_eq!(cache.transfer_state(&model()).await, Some(TransferState::Deleted));
    }

    #[tokio::test]
    async fn test_reassemble_requires_transferred() {
        let cache = CheckpointCache::new();
        assert!(matches!(
            cache.reassemble(&model()).await,
            Err(CheckpointEntityError::UnknownEntity(_))
        ));

        cache.add_chunk(&model(), 0, vec![1], 2).await.unwrap();
        assert!(matches!(
            cache.reassemble(&model()).await,
            Err(CheckpointEntityError::NotTransferred {
                state: TransferState::Transferring,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_invalid_chunks_rejected() {
        let cache = CheckpointCache::new();
        assert!(matches!(
            cache.add_chunk(&model(), 0, vec![], 0).await,
            Err(CheckpointEntityError::ZeroChunks(_))
        ));
        assert!(matches!(
            cache.add_chunk(&model(), 3, vec![], 3).await,
            Err(CheckpointEntityError::OutOfRange { index: 3, .. })
        ));
        // Rejected chunks do not create the entity
        assert_eq!(cache.transfer_state(&model()).await, None);

        cache.add_chunk(&model(), 0, vec![1], 3).await.unwrap();
        assert_eq!(
            cache.add_chunk(&model(), 1, vec![2], 4).await,
            Err(CheckpointEntityError::ChunkCountMismatch {
                id: model(),
                expected: 3,
                got: 4
            })
        );
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let cache = CheckpointCache::new();
        let optimizer = ResourceId::new("gs-1", 0, 3, "optimizer");

        cache.add_chunk(&model(), 0, vec![1], 1).await.unwrap();
        cache.add_chunk(&optimizer, 0, vec![2], 2).await.unwrap();

        assert_eq!(cache.transfer_state(&model()).await, Some(TransferState::Transferred));
        assert_eq!(cache.transfer_state(&optimizer).await, Some(TransferState::Transferring));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_apply_routes_messages() {
        let cache = CheckpointCache::new();
        let data = ChunkMessage::Data {
            id: model(),
            index: 0,
            bytes: vec![5],
            final_num_chunks: 1,
        };
        assert_eq!(cache.apply(data).await.unwrap(), TransferState::Transferred);
        assert_eq!(
            cache.apply(ChunkMessage::Delete { id: model() }).await.unwrap(),
            TransferState::Deleted
        );
    }

    #[tokio::test]
    async fn test_evict_stale_only_touches_stalled_transfers() {
        let cache = CheckpointCache::new();
        let done = ResourceId::new("gs-1", 0, 1, "model");
        cache.add_chunk(&done, 0, vec![1], 1).await.unwrap();
        cache.add_chunk(&model(), 0, vec![1], 2).await.unwrap();

        assert_eq!(cache.evict_stale(Duration::from_secs(60)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.evict_stale(Duration::from_millis(5)).await, 1);
        assert_eq!(cache.transfer_state(&model()).await, None);
        assert_eq!(cache.transfer_state(&done).await, Some(TransferState::Transferred));
    }
}
