//! Volatile in-memory event store.

use std::sync::{Arc, PoisonError, RwLock};

use super::{EventStore, Replay, StoreError};
use crate::protocol::{Event, EventRecord};

/// In-memory event log, lost when the process exits.
///
/// Events are kept behind `Arc` so a replay snapshot only copies pointers.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Arc<Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn append(&self, event: &Event) -> Result<u64, StoreError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let seq = events.len() as u64;
        events.push(Arc::new(event.clone()));
        Ok(seq)
    }

    fn replay_range(&self, start: u64, end: u64) -> Result<Replay, StoreError> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        let end = end.min(events.len() as u64) as usize;
        let start = (start as usize).min(end);
        let snapshot: Vec<Arc<Event>> = events[start..end].to_vec();
        drop(events);

        Ok(Box::new(snapshot.into_iter().enumerate().map(move |(offset, event)| {
            Ok(EventRecord::new((start + offset) as u64, (*event).clone()))
        })))
    }

    fn len(&self) -> u64 {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }
}
