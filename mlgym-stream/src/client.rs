//! WebSocket client for training workers and dashboards.
//!
//! Provides:
//! - Connection lifecycle (connect, leave) with room joins on connect
//! - Event publishing, including chunked checkpoint transfers
//! - Offline queue for events published while disconnected
//! - Sequence-number cursors so a reconnect replay is not reported twice
//! - Reassembly of incoming checkpoint chunks

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::checkpoint::{
    checkpoint_events, delete_event, CheckpointCache, ChunkMessage, CodecError, ResourceId, TransferState,
    MAX_CHUNKS,
};
use crate::protocol::{ClientMessage, Event, EventRecord, ProtocolError, ServerMessage};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the server, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Rooms joined on every connect
    pub rooms: Vec<String>,
    /// Label sent with the join, only used for server logs
    pub session_label: Option<String>,
    /// Events kept while disconnected
    pub offline_queue_size: usize,
    /// Capacity of the application event channel
    pub event_buffer: usize,
    /// Idle time after which an incomplete checkpoint transfer is dropped
    pub transfer_timeout: Duration,
    /// Largest chunk count accepted for an incoming checkpoint resource
    pub max_checkpoint_chunks: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            rooms: Vec::new(),
            session_label: None,
            offline_queue_size: 10_000,
            event_buffer: 256,
            transfer_timeout: Duration::from_secs(600),
            max_checkpoint_chunks: MAX_CHUNKS,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_rooms(mut self, rooms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.rooms = rooms.into_iter().map(Into::into).collect();
        self
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established and rooms joined
    Connected,
    /// Connection lost
    Disconnected,
    /// Stored history of a room not seen before
    Replayed {
        room_id: String,
        records: Vec<EventRecord>,
    },
    /// A live event
    Live(Arc<EventRecord>),
    /// Every chunk of a checkpoint resource has arrived
    CheckpointTransferred(ResourceId),
    Pong,
}

/// Offline queue for events published while disconnected.
///
/// Queued events are published on the next connect, oldest first.
pub struct OfflineQueue {
    queue: VecDeque<Event>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an event; returns `false` when the queue is full.
    pub fn enqueue(&mut self, event: Event) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(event);
        true
    }

    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Next expected sequence number per room.
#[derive(Debug, Default)]
pub struct RoomCursors {
    next: HashMap<String, u64>,
}

impl RoomCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the room's cursor past `record`; `false` if it was already seen.
    pub fn accept(&mut self, record: &EventRecord) -> bool {
        let next = self.next.entry(record.room_id().to_string()).or_insert(0);
        if record.seq < *next {
            return false;
        }
        *next = record.seq + 1;
        true
    }

    /// First sequence number not yet seen in `room_id`.
    pub fn position(&self, room_id: &str) -> u64 {
        self.next.get(room_id).copied().unwrap_or(0)
    }
}

/// The monitoring client.
pub struct MonitorClient {
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Events published while disconnected
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Incoming checkpoint resources
    checkpoints: Arc<CheckpointCache>,

    /// Survives reconnects, so replays only report unseen records
    cursors: Arc<Mutex<RoomCursors>>,
}

impl MonitorClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(config.offline_queue_size))),
            checkpoints: Arc::new(CheckpointCache::with_max_chunks(config.max_checkpoint_chunks)),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            cursors: Arc::new(Mutex::new(RoomCursors::new())),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the configured rooms.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(out_tx);

        if !self.config.rooms.is_empty() {
            let join = ClientMessage::Join {
                session_id: self.config.session_label.clone(),
                rooms: self.config.rooms.clone(),
            };
            self.send(&join).await?;
        }

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, ClientEvent::Connected).await;

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Publishing {} queued events", queued.len());
            for event in queued {
                self.send(&ClientMessage::publish(event)?).await?;
            }
        }

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let checkpoints = self.checkpoints.clone();
        let cursors = self.cursors.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            for event in absorb(server_msg, &cursors, &checkpoints).await {
                                emit(&event_tx, event).await;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Publish an event; queued while disconnected.
    ///
    /// Events that fail validation are refused up front, never queued.
    pub async fn publish(&self, event: Event) -> Result<(), ClientError> {
        event.validate()?;
        if *self.state.read().await == ConnectionState::Connected {
            if let Some(ref tx) = self.outgoing_tx {
                let encoded = ClientMessage::publish(event.clone())?.encode()?;
                if tx.send(encoded).await.is_ok() {
                    return Ok(());
                }
                log::debug!("Writer task stopped, queueing event for the next connect");
            }
        }
        self.enqueue(event).await
    }

    async fn enqueue(&self, event: Event) -> Result<(), ClientError> {
        if self.offline_queue.lock().await.enqueue(event) {
            Ok(())
        } else {
            Err(ClientError::OfflineQueueFull)
        }
    }

    /// Publish `blob` as checkpoint resource `id` in `chunk_size` chunks.
    ///
    /// Returns the number of chunks published.
    pub async fn publish_checkpoint(&self, id: &ResourceId, blob: &[u8], chunk_size: usize) -> Result<usize, ClientError> {
        let events = checkpoint_events(id, blob, chunk_size)?;
        let count = events.len();
        for event in events {
            self.publish(event).await?;
        }
        log::debug!("Published checkpoint resource {id} in {count} chunks");
        Ok(count)
    }

    /// Ask every receiver to drop checkpoint resource `id`.
    pub async fn delete_checkpoint(&self, id: &ResourceId) -> Result<(), ClientError> {
        self.publish(delete_event(id)).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Leave all rooms; the server closes the connection.
    pub async fn leave(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Leave).await?;
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(encoded).await.map_err(|_| ClientError::NotConnected)
    }

    /// Drop incomplete checkpoint transfers idle for longer than the
    /// configured timeout.
    pub async fn evict_stale_transfers(&self) -> usize {
        self.checkpoints.evict_stale(self.config.transfer_timeout).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Checkpoint resources received so far.
    pub fn checkpoints(&self) -> &Arc<CheckpointCache> {
        &self.checkpoints
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

/// Hand an event to the application, which may have dropped its receiver.
async fn emit(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if event_tx.send(event).await.is_err() {
        log::trace!("Event receiver dropped, discarding client event");
    }
}

/// Turn one server message into application events, dropping records the
/// client has already seen and feeding checkpoint chunks into the cache.
async fn absorb(msg: ServerMessage, cursors: &Mutex<RoomCursors>, checkpoints: &CheckpointCache) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    match msg {
        ServerMessage::Event(record) => {
            if !cursors.lock().await.accept(&record) {
                return events;
            }
            events.push(ClientEvent::Live(record.clone()));
            events.extend(absorb_checkpoint(&record, checkpoints).await);
        }
        ServerMessage::Batch(records) => {
            let fresh: Vec<EventRecord> = {
                let mut cursors = cursors.lock().await;
                records.into_iter().filter(|r| cursors.accept(r)).collect()
            };
            let Some(room_id) = fresh.first().map(|r| r.room_id().to_string()) else {
                return events;
            };

            let mut transferred = Vec::new();
            for record in &fresh {
                transferred.extend(absorb_checkpoint(record, checkpoints).await);
            }
            events.push(ClientEvent::Replayed { room_id, records: fresh });
            events.extend(transferred);
        }
        ServerMessage::Pong => events.push(ClientEvent::Pong),
    }
    events
}

async fn absorb_checkpoint(record: &EventRecord, checkpoints: &CheckpointCache) -> Option<ClientEvent> {
    let chunk = record.event.as_checkpoint()?.clone();
    let message = match ChunkMessage::from_payload(chunk) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Ignoring checkpoint chunk at seq {} of {}: {e}", record.seq, record.room_id());
            return None;
        }
    };

    let id = message.id().clone();
    let is_data = matches!(message, ChunkMessage::Data { .. });
    match checkpoints.apply(message).await {
        Ok(TransferState::Transferred) if is_data => Some(ClientEvent::CheckpointTransferred(id)),
        Ok(_) => None,
        Err(e) => {
            log::warn!("Rejected checkpoint chunk for {id}: {e}");
            None
        }
    }
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("not connected")]
    NotConnected,
    #[error("offline queue full")]
    OfflineQueueFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CheckpointChunk, ExperimentStatus};
    use serde_json::Map;

    fn status(room: &str, epoch: u64) -> Event {
        Event::experiment_status(ExperimentStatus {
            room_id: room.to_string(),
            experiment_id: 0,
            status: "training".to_string(),
            current_epoch: Some(epoch),
            num_epochs: Some(10),
            extra: Map::new(),
        })
    }

    fn record(room: &str, seq: u64) -> EventRecord {
        EventRecord::new(seq, status(room, seq))
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::new("ws://localhost:9090").with_rooms(["gs-1", "gs-2"]);
        assert_eq!(config.server_url, "ws://localhost:9090");
        assert_eq!(config.rooms, vec!["gs-1".to_string(), "gs-2".to_string()]);
        assert_eq!(config.offline_queue_size, 10_000);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = MonitorClient::new(ClientConfig::default());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert!(client.checkpoints().is_empty().await);
    }

    #[tokio::test]
    async fn test_publish_offline_queues() {
        let client = MonitorClient::new(ClientConfig::default());
        client.publish(status("gs-1", 0)).await.unwrap();
        client.publish(status("gs-1", 1)).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
    }

    #[tokio::test]
    async fn test_publish_checkpoint_offline_queues_every_chunk() {
        let client = MonitorClient::new(ClientConfig::default());
        let id = ResourceId::new("gs-1", 0, 1, "model");
        assert_eq!(client.publish_checkpoint(&id, &[7; 10], 4).await.unwrap(), 3);
        client.delete_checkpoint(&id).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 4);

        assert!(matches!(
            client.publish_checkpoint(&id, &[], 4).await,
            Err(ClientError::Codec(CodecError::EmptyBlob(_)))
        ));
    }

    #[tokio::test]
    async fn test_offline_queue_full() {
        let config = ClientConfig {
            offline_queue_size: 1,
            ..ClientConfig::default()
        };
        let client = MonitorClient::new(config);
        client.publish(status("gs-1", 0)).await.unwrap();
        assert!(matches!(
            client.publish(status("gs-1", 1)).await,
            Err(ClientError::OfflineQueueFull)
        ));
    }

    #[tokio::test]
    async fn test_ping_requires_connection() {
        let client = MonitorClient::new(ClientConfig::default());
        assert!(matches!(client.ping().await, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let mut client = MonitorClient::new(ClientConfig::new("ws://127.0.0.1:1"));
        assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(status("gs-1", 0));
        queue.enqueue(status("gs-1", 1));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body, status("gs-1", 0).body);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity_and_clear() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(status("gs-1", 0)));
        assert!(queue.enqueue(status("gs-1", 1)));
        assert!(!queue.enqueue(status("gs-1", 2)));
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_room_cursors_dedup() {
        let mut cursors = RoomCursors::new();
        assert!(cursors.accept(&record("gs-1", 0)));
        assert!(cursors.accept(&record("gs-1", 1)));
        assert!(!cursors.accept(&record("gs-1", 1)));
        assert!(!cursors.accept(&record("gs-1", 0)));
        assert!(cursors.accept(&record("gs-2", 0)));

        assert_eq!(cursors.position("gs-1"), 2);
        assert_eq!(cursors.position("gs-2"), 1);
        assert_eq!(cursors.position("gs-3"), 0);
    }

    #[tokio::test]
    async fn test_absorb_replay_after_reconnect_reports_only_new_records() {
        let cursors = Mutex::new(RoomCursors::new());
        let cache = CheckpointCache::new();

        let first = absorb(
            ServerMessage::Batch(vec![record("gs-1", 0), record("gs-1", 1)]),
            &cursors,
            &cache,
        )
        .await;
        assert!(matches!(&first[..], [ClientEvent::Replayed { records, .. }] if records.len() == 2));

        let again = absorb(
            ServerMessage::Batch(vec![record("gs-1", 0), record("gs-1", 1), record("gs-1", 2)]),
            &cursors,
            &cache,
        )
        .await;
        match &again[..] {
            [ClientEvent::Replayed { room_id, records }] => {
                assert_eq!(room_id, "gs-1");
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].seq, 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        let live = absorb(ServerMessage::Event(Arc::new(record("gs-1", 2))), &cursors, &cache).await;
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_absorb_announces_completed_checkpoint() {
        let cursors = Mutex::new(RoomCursors::new());
        let cache = CheckpointCache::new();
        let id = ResourceId::new("gs-1", 0, 1, "model");

        let events = checkpoint_events(&id, &[1, 2, 3, 4, 5], 2).unwrap();
        let mut announced = Vec::new();
        for (seq, event) in events.into_iter().enumerate() {
            let record = Arc::new(EventRecord::new(seq as u64, event));
            for out in absorb(ServerMessage::Event(record), &cursors, &cache).await {
                if let ClientEvent::CheckpointTransferred(done) = out {
                    announced.push(done);
                }
            }
        }

        assert_eq!(announced, vec![id.clone()]);
        assert_eq!(cache.reassemble(&id).await.unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_absorb_ignores_malformed_chunk() {
        let cursors = Mutex::new(RoomCursors::new());
        let cache = CheckpointCache::new();
        let chunk = CheckpointChunk {
            room_id: "gs-1".to_string(),
            experiment_id: 0,
            checkpoint_id: 1,
            entity_id: "model".to_string(),
            chunk_data: None,
            chunk_id: 0,
            final_num_chunks: 1,
        };
        let record = Arc::new(EventRecord::new(0, Event::checkpoint(chunk)));

        let events = absorb(ServerMessage::Event(record), &cursors, &cache).await;
        assert!(matches!(&events[..], [ClientEvent::Live(_)]));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_absorb_survives_oversized_chunk_count() {
        let cursors = Mutex::new(RoomCursors::new());
        let cache = CheckpointCache::new();
        let chunk = CheckpointChunk {
            room_id: "gs-1".to_string(),
            experiment_id: 0,
            checkpoint_id: 1,
            entity_id: "model".to_string(),
            chunk_data: Some(vec![1]),
            chunk_id: 0,
            final_num_chunks: 1 << 63,
        };
        let oversized = Arc::new(EventRecord::new(0, Event::checkpoint(chunk)));

        let events = absorb(ServerMessage::Event(oversized), &cursors, &cache).await;
        assert!(matches!(&events[..], [ClientEvent::Live(_)]));
        assert!(cache.is_empty().await);

        // The next record is still processed
        let events = absorb(ServerMessage::Event(Arc::new(record("gs-1", 1))), &cursors, &cache).await;
        assert!(matches!(&events[..], [ClientEvent::Live(r)] if r.seq == 1));
    }

    #[tokio::test]
    async fn test_client_checkpoint_limit_from_config() {
        let config = ClientConfig {
            max_checkpoint_chunks: 8,
            ..ClientConfig::default()
        };
        let client = MonitorClient::new(config);
        assert_eq!(client.checkpoints().max_chunks(), 8);
    }

    #[tokio::test]
    async fn test_publish_refuses_non_finite_metrics() {
        let client = MonitorClient::new(ClientConfig::default());
        let mut losses = std::collections::BTreeMap::new();
        losses.insert("cross_entropy".to_string(), f64::NAN);
        let event = Event::evaluation_result(crate::protocol::EvaluationResult {
            room_id: "gs-1".to_string(),
            experiment_id: 0,
            epoch: 1,
            metrics: std::collections::BTreeMap::new(),
            losses,
        });

        assert!(matches!(
            client.publish(event).await,
            Err(ClientError::Protocol(ProtocolError::MalformedPayload { .. }))
        ));
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        emit(&tx, ClientEvent::Pong).await;
        drop(rx);
        // Completes without blocking or panicking
        tokio::time::timeout(Duration::from_secs(1), emit(&tx, ClientEvent::Disconnected))
            .await
            .unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = MonitorClient::new(ClientConfig::default());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
