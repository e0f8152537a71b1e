//! Per-room live fan-out.
//!
//! Uses a tokio broadcast channel per room for O(1) send to all members.
//! Each member gets an independent receiver that buffers up to `capacity`
//! records; a member that falls further behind observes `Lagged` and is
//! expected to catch up from the room's store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{EventRecord, SessionId};

/// A member of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub session_id: SessionId,
    /// Room length when the member subscribed; its first live record
    pub joined_at: u64,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Records skipped by lagging receivers
    pub messages_lagged: u64,
    pub active_members: usize,
}

/// Atomic broadcast stats, updated without locking on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }
}

/// The broadcast group of a single room.
///
/// Records are shared as `Arc<EventRecord>` so a fan-out to N members never
/// clones the event.
pub struct BroadcastGroup {
    /// Broadcast channel sender
    sender: broadcast::Sender<Arc<EventRecord>>,

    /// Current members of this room
    members: RwLock<HashMap<SessionId, MemberInfo>>,

    /// Channel capacity (records buffered per receiver)
    capacity: usize,

    /// Lock-free stats (atomics)
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a member and return its live receiver.
    ///
    /// The receiver sees every record sent after this call returns.
    pub async fn add_member(&self, info: MemberInfo) -> broadcast::Receiver<Arc<EventRecord>> {
        let mut members = self.members.write().await;
        members.insert(info.session_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, session_id: &SessionId) -> Option<MemberInfo> {
        self.members.write().await.remove(session_id)
    }

    /// Send a record to every current receiver.
    ///
    /// Returns the number of receivers; zero when the room has no members.
    pub fn send(&self, record: Arc<EventRecord>) -> usize {
        let count = self.sender.send(record).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for `skipped` records a lagging receiver lost.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, session_id: &SessionId) -> bool {
        self.members.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without membership, used by observers such as benches.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EventRecord>> {
        self.sender.subscribe()
    }
}
