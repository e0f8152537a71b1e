//! JSON channel protocol for training telemetry.
//!
//! Frames are WebSocket text messages carrying one JSON object each.
//!
//! Client → server, tagged by `type`:
//! ```text
//! {"type":"join","rooms":["gs-1"]}
//! {"type":"leave"}
//! {"type":"ping"}
//! {"type":"mlgym_event","event_type":"job_status","creation_ts":0,"payload":{"room_id":"gs-1",...}}
//! ```
//!
//! Server → client, tagged by `event_id`:
//! ```text
//! {"event_id":5,"data":<Event>}                                 live event, seq 5
//! {"event_id":"batched_events","data":[{"event_id":0,...},...]}  replay on join
//! {"event_id":"pong","data":{}}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::checkpoint::MAX_CHUNKS;

/// Sentinel `event_id` of the replay batch sent on join.
pub const BATCHED_EVENTS: &str = "batched_events";
/// Sentinel `event_id` of a liveness reply.
pub const PONG: &str = "pong";

/// Identifier of one connected session, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The recognized event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Progress of a single experiment
    ExperimentStatus,
    /// Lifecycle of a scheduled job
    JobStatus,
    /// Snapshot of an experiment's configuration
    ExperimentConfig,
    /// Metrics and losses of one evaluation pass
    EvaluationResult,
    /// One chunk (or delete signal) of a checkpoint resource
    Checkpoint,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::ExperimentStatus,
        EventType::JobStatus,
        EventType::ExperimentConfig,
        EventType::EvaluationResult,
        EventType::Checkpoint,
    ];

    /// Wire name of this event type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ExperimentStatus => "experiment_status",
            EventType::JobStatus => "job_status",
            EventType::ExperimentConfig => "experiment_config",
            EventType::EvaluationResult => "evaluation_result",
            EventType::Checkpoint => "checkpoint",
        }
    }
}

impl FromStr for EventType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEventType(s.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status update of one experiment within a run group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    pub room_id: String,
    pub experiment_id: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_epochs: Option<u64>,
    /// Free-form fields reported by the trainer
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Status of a scheduled training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub room_id: String,
    pub job_id: String,
    pub job_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Configuration snapshot of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub room_id: String,
    pub experiment_id: u64,
    pub config: Value,
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub room_id: String,
    pub experiment_id: u64,
    pub epoch: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub losses: BTreeMap<String, f64>,
}

/// One chunk of a checkpoint resource.
///
/// `chunk_data = None` together with `chunk_id = -1` is the delete signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointChunk {
    pub room_id: String,
    pub experiment_id: u64,
    pub checkpoint_id: u64,
    pub entity_id: String,
    #[serde(default, with = "base64_bytes")]
    pub chunk_data: Option<Vec<u8>>,
    pub chunk_id: i64,
    #[serde(default)]
    pub final_num_chunks: u64,
}

/// Typed event payloads, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    ExperimentStatus(ExperimentStatus),
    JobStatus(JobStatus),
    ExperimentConfig(ExperimentConfig),
    EvaluationResult(EvaluationResult),
    Checkpoint(CheckpointChunk),
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::ExperimentStatus(_) => EventType::ExperimentStatus,
            EventBody::JobStatus(_) => EventType::JobStatus,
            EventBody::ExperimentConfig(_) => EventType::ExperimentConfig,
            EventBody::EvaluationResult(_) => EventType::EvaluationResult,
            EventBody::Checkpoint(_) => EventType::Checkpoint,
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            EventBody::ExperimentStatus(p) => &p.room_id,
            EventBody::JobStatus(p) => &p.room_id,
            EventBody::ExperimentConfig(p) => &p.room_id,
            EventBody::EvaluationResult(p) => &p.room_id,
            EventBody::Checkpoint(p) => &p.room_id,
        }
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventBody::ExperimentStatus(p) => serde_json::to_value(p),
            EventBody::JobStatus(p) => serde_json::to_value(p),
            EventBody::ExperimentConfig(p) => serde_json::to_value(p),
            EventBody::EvaluationResult(p) => serde_json::to_value(p),
            EventBody::Checkpoint(p) => serde_json::to_value(p),
        }
    }
}

/// Wire-level event before validation.
///
/// The payload is kept as untyped JSON so that unrecognized event types can be
/// reported instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_type: String,
    #[serde(default)]
    pub creation_ts: u64,
    pub payload: Value,
}

/// A validated telemetry event.
///
/// Serializes to the same `{event_type, creation_ts, payload}` object as
/// [`RawEvent`]; serializing an event that fails [`Event::validate`] is an
/// error.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct Event {
    /// Milliseconds since the Unix epoch, set by the publisher
    pub creation_ts: u64,
    pub body: EventBody,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(body: EventBody) -> Self {
        Self::at(now_millis(), body)
    }

    pub fn at(creation_ts: u64, body: EventBody) -> Self {
        Self { creation_ts, body }
    }

    pub fn experiment_status(status: ExperimentStatus) -> Self {
        Self::new(EventBody::ExperimentStatus(status))
    }

    pub fn job_status(status: JobStatus) -> Self {
        Self::new(EventBody::JobStatus(status))
    }

    pub fn experiment_config(config: ExperimentConfig) -> Self {
        Self::new(EventBody::ExperimentConfig(config))
    }

    pub fn evaluation_result(result: EvaluationResult) -> Self {
        Self::new(EventBody::EvaluationResult(result))
    }

    pub fn checkpoint(chunk: CheckpointChunk) -> Self {
        Self::new(EventBody::Checkpoint(chunk))
    }

    /// The room this event is routed to.
    pub fn room_id(&self) -> &str {
        self.body.room_id()
    }

    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }

    pub fn as_checkpoint(&self) -> Option<&CheckpointChunk> {
        match &self.body {
            EventBody::Checkpoint(chunk) => Some(chunk),
            _ => None,
        }
    }

    /// Check what the payload types alone cannot express.
    ///
    /// JSON has no NaN or infinity, so a non-finite metric would be written
    /// as `null` and could never be read back.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let malformed = |reason: String| ProtocolError::MalformedPayload {
            event_type: self.event_type().as_str().to_string(),
            reason,
        };

        if self.room_id().is_empty() {
            return Err(malformed("empty room_id".to_string()));
        }

        match &self.body {
            EventBody::EvaluationResult(result) => {
                let non_finite = result
                    .metrics
                    .iter()
                    .chain(&result.losses)
                    .find(|(_, value)| !value.is_finite());
                if let Some((name, value)) = non_finite {
                    return Err(malformed(format!("non-finite value {value} for `{name}`")));
                }
            }
            EventBody::Checkpoint(chunk) if chunk.final_num_chunks > MAX_CHUNKS => {
                return Err(malformed(format!(
                    "final_num_chunks {} exceeds the limit of {MAX_CHUNKS}",
                    chunk.final_num_chunks
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.validate().map_err(<S::Error as serde::ser::Error>::custom)?;

        let mut state = serializer.serialize_struct("Event", 3)?;
        state.serialize_field("event_type", self.event_type().as_str())?;
        state.serialize_field("creation_ts", &self.creation_ts)?;
        match &self.body {
            EventBody::ExperimentStatus(p) => state.serialize_field("payload", p)?,
            EventBody::JobStatus(p) => state.serialize_field("payload", p)?,
            EventBody::ExperimentConfig(p) => state.serialize_field("payload", p)?,
            EventBody::EvaluationResult(p) => state.serialize_field("payload", p)?,
            EventBody::Checkpoint(p) => state.serialize_field("payload", p)?,
        }
        state.end()
    }
}

impl TryFrom<RawEvent> for Event {
    type Error = ProtocolError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let RawEvent {
            event_type: name,
            creation_ts,
            payload,
        } = raw;
        let event_type: EventType = name.parse()?;
        let malformed = |reason: String| ProtocolError::MalformedPayload {
            event_type: name.clone(),
            reason,
        };

        let body = match event_type {
            EventType::ExperimentStatus => EventBody::ExperimentStatus(typed_payload(payload, &malformed)?),
            EventType::JobStatus => EventBody::JobStatus(typed_payload(payload, &malformed)?),
            EventType::ExperimentConfig => EventBody::ExperimentConfig(typed_payload(payload, &malformed)?),
            EventType::EvaluationResult => EventBody::EvaluationResult(typed_payload(payload, &malformed)?),
            EventType::Checkpoint => EventBody::Checkpoint(typed_payload(payload, &malformed)?),
        };

        let event = Self { creation_ts, body };
        event.validate()?;
        Ok(event)
    }
}

impl TryFrom<Event> for RawEvent {
    type Error = ProtocolError;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        event.validate()?;
        Ok(Self {
            event_type: event.event_type().as_str().to_string(),
            creation_ts: event.creation_ts,
            payload: event.body.to_payload()?,
        })
    }
}

fn typed_payload<T, F>(payload: Value, malformed: &F) -> Result<T, ProtocolError>
where
    T: serde::de::DeserializeOwned,
    F: Fn(String) -> ProtocolError,
{
    serde_json::from_value(payload).map_err(|e| malformed(e.to_string()))
}

/// An event together with its position in the room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Sequence number within the room, 0-based and contiguous
    #[serde(rename = "event_id")]
    pub seq: u64,
    #[serde(rename = "data")]
    pub event: Event,
}

impl EventRecord {
    pub fn new(seq: u64, event: Event) -> Self {
        Self { seq, event }
    }

    pub fn room_id(&self) -> &str {
        self.event.room_id()
    }
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join one or more rooms; the server replays each room's history.
    Join {
        /// Optional client-chosen label, only used for logging
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        rooms: Vec<String>,
    },
    /// Leave every room and close the connection.
    Leave,
    Ping,
    /// Publish an event to the room named in its payload.
    MlgymEvent(RawEvent),
}

impl ClientMessage {
    pub fn join(rooms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ClientMessage::Join {
            session_id: None,
            rooms: rooms.into_iter().map(Into::into).collect(),
        }
    }

    /// Wrap `event` for publishing; fails if the event does not validate.
    pub fn publish(event: Event) -> Result<Self, ProtocolError> {
        Ok(ClientMessage::MlgymEvent(RawEvent::try_from(event)?))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A single live event.
    Event(Arc<EventRecord>),
    /// The stored history of one room, sent once on join.
    Batch(Vec<EventRecord>),
    Pong,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    event_id: Value,
    data: Value,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            ServerMessage::Event(record) => Envelope {
                event_id: Value::from(record.seq),
                data: serde_json::to_value(&record.event)?,
            },
            ServerMessage::Batch(records) => Envelope {
                event_id: Value::from(BATCHED_EVENTS),
                data: serde_json::to_value(records)?,
            },
            ServerMessage::Pong => Envelope {
                event_id: Value::from(PONG),
                data: Value::Object(Map::new()),
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.event_id {
            Value::Number(n) => {
                let seq = n
                    .as_u64()
                    .ok_or_else(|| ProtocolError::UnknownMessage(n.to_string()))?;
                let event: Event = serde_json::from_value(envelope.data)?;
                Ok(ServerMessage::Event(Arc::new(EventRecord::new(seq, event))))
            }
            Value::String(id) if id == BATCHED_EVENTS => {
                Ok(ServerMessage::Batch(serde_json::from_value(envelope.data)?))
            }
            Value::String(id) if id == PONG => Ok(ServerMessage::Pong),
            other => Err(ProtocolError::UnknownMessage(other.to_string())),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unrecognized event type `{0}`")]
    UnknownEventType(String),
    #[error("malformed `{event_type}` payload: {reason}")]
    MalformedPayload { event_type: String, reason: String },
    #[error("unrecognized server message id {0}")]
    UnknownMessage(String),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Checkpoint bytes travel as base64 text inside JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|text| STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
