//! Room hub: routes published events to room stores and room members.
//!
//! Architecture:
//! ```text
//! publish(event) ──► Room(room_id) ── write_lock ──┬── EventStore.append ─► seq
//!                                                  └── BroadcastGroup.send(seq, event)
//!                                                            │
//!                                   ┌────────────────────────┼──────────────┐
//!                                   ▼                        ▼              ▼
//!                              forwarder A              forwarder B      ...
//!                                   │ dedup by seq           │
//!                                   │ catch up from store    │
//!                                   ▼                        ▼
//!                             Session A outbound       Session B outbound
//! ```
//!
//! Join takes the same per-room lock across subscribing and reading the store
//! length `K`, so the replay batch covers exactly `0..K` and the live stream
//! starts at `K`. A forwarder that lags behind the broadcast channel re-reads
//! the missed range from the store, so members never see a gap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastGroup, MemberInfo};
use crate::protocol::{Event, EventBody, EventRecord, ProtocolError, RawEvent, ServerMessage, SessionId};
use crate::storage::{EventStore, StoreError, StoreRegistry};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Live records buffered per member before it lags
    pub broadcast_capacity: usize,
    /// Messages buffered per session outbound queue
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            outbound_capacity: 1024,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub rooms: usize,
    pub sessions: usize,
    pub events_published: u64,
    /// Events dropped because they failed validation
    pub events_rejected: u64,
    pub storage_failures: u64,
}

struct AtomicHubStats {
    events_published: AtomicU64,
    events_rejected: AtomicU64,
    storage_failures: AtomicU64,
}

/// One room: its log, its live fan-out and the lock ordering both.
struct Room {
    id: String,
    store: Arc<dyn EventStore>,
    group: BroadcastGroup,
    /// Held across append + send, and across subscribe + length snapshot
    write_lock: Mutex<()>,
}

/// A registered session, handed to the transport.
pub struct Session {
    pub id: SessionId,
    /// Everything the hub sends to this session, in order
    pub outbound: mpsc::Receiver<ServerMessage>,
}

impl Session {
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.outbound.recv().await
    }
}

struct Membership {
    room: Arc<Room>,
    /// `None` while the join is still sending history
    forwarder: Option<JoinHandle<()>>,
}

struct SessionState {
    outbound: mpsc::Sender<ServerMessage>,
    rooms: HashMap<String, Membership>,
}

/// The room hub. Single writer of room membership.
pub struct Hub {
    config: HubConfig,
    registry: StoreRegistry,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    sessions: RwLock<HashMap<SessionId, SessionState>>,
    stats: AtomicHubStats,
}

impl Hub {
    pub fn new(config: HubConfig, registry: StoreRegistry) -> Self {
        Self {
            config,
            registry,
            rooms: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            stats: AtomicHubStats {
                events_published: AtomicU64::new(0),
                events_rejected: AtomicU64::new(0),
                storage_failures: AtomicU64::new(0),
            },
        }
    }

    /// Hub with default configuration and volatile storage.
    pub fn in_memory() -> Self {
        Self::new(HubConfig::default(), StoreRegistry::in_memory())
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    /// Open every room already persisted and report its length.
    pub fn recover(&self) -> Result<Vec<(String, u64)>, StoreError> {
        self.registry.recover()
    }

    /// Register a new session with an empty outbound queue.
    pub async fn open_session(&self) -> Session {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        self.sessions.write().await.insert(
            id,
            SessionState {
                outbound: tx,
                rooms: HashMap::new(),
            },
        );
        log::debug!("Session {id} opened");
        Session { id, outbound: rx }
    }

    /// Join `session_id` to each room in `room_ids`.
    ///
    /// Per room with history the session receives one batch with every
    /// stored event, followed by live events without gap or duplicate.
    pub async fn join(&self, session_id: SessionId, room_ids: &[String]) -> Result<(), HubError> {
        for room_id in room_ids {
            let room = self.room(room_id).await?;

            // Reserve the membership first so a concurrent join of the same
            // room by this session becomes a no-op
            let outbound = {
                let mut sessions = self.sessions.write().await;
                let state = sessions
                    .get_mut(&session_id)
                    .ok_or(HubError::UnknownSession(session_id))?;
                if state.rooms.contains_key(room_id) {
                    log::debug!("Session {session_id} already in room {room_id}");
                    continue;
                }
                state.rooms.insert(
                    room_id.clone(),
                    Membership {
                        room: room.clone(),
                        forwarder: None,
                    },
                );
                state.outbound.clone()
            };

            let (rx, snapshot) = {
                let _guard = room.write_lock.lock().await;
                let snapshot = room.store.len();
                let rx = room
                    .group
                    .add_member(MemberInfo {
                        session_id,
                        joined_at: snapshot,
                    })
                    .await;
                (rx, snapshot)
            };

            if let Err(e) = self.send_history(&room, snapshot, &outbound).await {
                if let Some(state) = self.sessions.write().await.get_mut(&session_id) {
                    state.rooms.remove(room_id);
                }
                room.group.remove_member(&session_id).await;
                return Err(e);
            }

            let forwarder = tokio::spawn(forward(room.clone(), rx, snapshot, outbound));

            let mut sessions = self.sessions.write().await;
            let membership = sessions
                .get_mut(&session_id)
                .and_then(|state| state.rooms.get_mut(room_id));
            match membership {
                Some(membership) => membership.forwarder = Some(forwarder),
                None => {
                    // Session left while the history was being sent
                    forwarder.abort();
                    room.group.remove_member(&session_id).await;
                    return Err(HubError::UnknownSession(session_id));
                }
            }

            log::info!("Session {session_id} joined room {room_id} ({snapshot} stored events)");
        }
        Ok(())
    }

    async fn send_history(
        &self,
        room: &Room,
        snapshot: u64,
        outbound: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), HubError> {
        if snapshot == 0 {
            return Ok(());
        }

        let store_error = |source| HubError::Store {
            room: room.id.clone(),
            source,
        };
        let records = room
            .store
            .replay_range(0, snapshot)
            .map_err(store_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;

        log::debug!("Replaying {} events of room {}", records.len(), room.id);
        outbound
            .send(ServerMessage::Batch(records))
            .await
            .map_err(|_| HubError::SessionClosed)
    }

    /// Remove `session_id` from every room and close its outbound queue.
    pub async fn leave(&self, session_id: SessionId) -> Result<(), HubError> {
        let state = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(HubError::UnknownSession(session_id))?;

        for (room_id, membership) in state.rooms {
            if let Some(forwarder) = membership.forwarder {
                forwarder.abort();
            }
            membership.room.group.remove_member(&session_id).await;
            log::debug!("Session {session_id} left room {room_id}");
        }
        log::info!("Session {session_id} closed");
        Ok(())
    }

    /// Append `event` to its room and fan it out to the room's members.
    ///
    /// Events that fail [`Event::validate`] are counted as rejected and never
    /// stored.
    pub async fn publish(&self, event: Event) -> Result<u64, HubError> {
        if let Err(e) = event.validate() {
            self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejecting invalid event for room {:?}: {e}", event.room_id());
            return Err(HubError::Invalid(e));
        }

        match &event.body {
            EventBody::ExperimentStatus(s) => {
                log::trace!("experiment {} status {} in {}", s.experiment_id, s.status, s.room_id)
            }
            EventBody::JobStatus(s) => log::trace!("job {} status {} in {}", s.job_id, s.status, s.room_id),
            EventBody::ExperimentConfig(c) => log::trace!("config of experiment {} in {}", c.experiment_id, c.room_id),
            EventBody::EvaluationResult(r) => log::trace!(
                "evaluation of experiment {} epoch {} in {}",
                r.experiment_id,
                r.epoch,
                r.room_id
            ),
            EventBody::Checkpoint(c) => log::trace!(
                "checkpoint chunk {}/{} of {} in {}",
                c.chunk_id,
                c.final_num_chunks,
                c.entity_id,
                c.room_id
            ),
        }

        let room = self.room(event.room_id()).await?;

        let _guard = room.write_lock.lock().await;
        let seq = match room.store.append(&event) {
            Ok(seq) => seq,
            Err(source) => {
                self.stats.storage_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to store event for room {}: {source}", room.id);
                return Err(HubError::Store {
                    room: room.id.clone(),
                    source,
                });
            }
        };
        room.group.send(Arc::new(EventRecord::new(seq, event)));
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Validate and publish a wire-level event.
    ///
    /// Returns `Ok(None)` when the event was dropped as invalid.
    pub async fn publish_raw(&self, raw: RawEvent) -> Result<Option<u64>, HubError> {
        let event = match Event::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping invalid event: {e}");
                return Ok(None);
            }
        };

        match self.publish(event).await {
            Ok(seq) => Ok(Some(seq)),
            // Already counted by publish
            Err(HubError::Invalid(_)) => Ok(None),
            Err(HubError::Store {
                room,
                source: StoreError::InvalidRoomId(_),
            }) => {
                self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping event for invalid room id {room:?}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn room(&self, room_id: &str) -> Result<Arc<Room>, HubError> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return Ok(room.clone());
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }

        let store = self.registry.open(room_id).map_err(|source| HubError::Store {
            room: room_id.to_string(),
            source,
        })?;
        log::info!("Room {room_id} active ({} stored events)", store.len());

        let room = Arc::new(Room {
            id: room_id.to_string(),
            store,
            group: BroadcastGroup::new(self.config.broadcast_capacity),
            write_lock: Mutex::new(()),
        });
        rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    /// Ids of all active rooms, sorted.
    pub async fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Sessions currently in `room_id`.
    pub async fn members(&self, room_id: &str) -> Vec<SessionId> {
        let room = self.rooms.read().await.get(room_id).cloned();
        match room {
            Some(room) => room.group.members().await.into_iter().map(|m| m.session_id).collect(),
            None => Vec::new(),
        }
    }

    /// Number of stored events of an active room.
    pub async fn room_len(&self, room_id: &str) -> Option<u64> {
        self.rooms.read().await.get(room_id).map(|room| room.store.len())
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            rooms: self.rooms.read().await.len(),
            sessions: self.sessions.read().await.len(),
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_rejected: self.stats.events_rejected.load(Ordering::Relaxed),
            storage_failures: self.stats.storage_failures.load(Ordering::Relaxed),
        }
    }
}

/// Move live records of one room into one session's outbound queue.
///
/// `next_seq` is the first sequence number the session has not seen.
async fn forward(
    room: Arc<Room>,
    mut rx: broadcast::Receiver<Arc<EventRecord>>,
    mut next_seq: u64,
    outbound: mpsc::Sender<ServerMessage>,
) {
    loop {
        let catch_up_to = match rx.recv().await {
            Ok(record) if record.seq < next_seq => continue,
            Ok(record) if record.seq == next_seq => {
                next_seq += 1;
                if outbound.send(ServerMessage::Event(record)).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(record) => record.seq + 1,
            Err(RecvError::Lagged(skipped)) => {
                room.group.record_lag(skipped);
                log::warn!("Member of room {} lagged by {skipped} events, catching up from store", room.id);
                room.store.len()
            }
            Err(RecvError::Closed) => return,
        };

        if !catch_up(&room, &mut next_seq, catch_up_to, &outbound).await {
            return;
        }
    }
}

/// Send stored records `next_seq..end`. Returns `false` once the session is gone
/// or the store cannot be read.
async fn catch_up(room: &Room, next_seq: &mut u64, end: u64, outbound: &mpsc::Sender<ServerMessage>) -> bool {
    let replay = match room.store.replay_range(*next_seq, end) {
        Ok(replay) => replay,
        Err(e) => {
            log::error!("Failed to read room {} for catch-up: {e}", room.id);
            return false;
        }
    };

    for record in replay {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                log::error!("Failed to read room {} for catch-up: {e}", room.id);
                return false;
            }
        };
        *next_seq = record.seq + 1;
        if outbound.send(ServerMessage::Event(Arc::new(record))).await.is_err() {
            return false;
        }
    }
    true
}

/// Hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("storage failure in room {room:?}")]
    Store {
        room: String,
        #[source]
        source: StoreError,
    },
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("session closed its outbound queue")]
    SessionClosed,
    #[error("invalid event: {0}")]
    Invalid(#[source] ProtocolError),
}
