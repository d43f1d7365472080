use std::collections::{HashMap, HashSet};

use shared::{domain::RoomId, protocol::MessageEvent};
use tokio::sync::Mutex;
use tracing::debug;

/// Bounded per-room event buffer. Events are unique by id and kept in
/// chronological order; once the cap is exceeded the oldest entries go first.
pub struct TimelineCache {
    capacity: usize,
    rooms: Mutex<HashMap<RoomId, Vec<MessageEvent>>>,
}

impl TimelineCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, room_id: &RoomId) -> Vec<MessageEvent> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The first occurrence of an event id wins, so a cached copy takes
    /// precedence over a re-fetched one. `fetched` must already be in
    /// chronological order.
    pub async fn merge(&self, room_id: &RoomId, fetched: Vec<MessageEvent>) -> Vec<MessageEvent> {
        let mut guard = self.rooms.lock().await;
        let timeline = guard.entry(room_id.clone()).or_default();

        let mut seen: HashSet<_> = timeline.iter().map(|event| event.event_id.clone()).collect();
        for event in fetched {
            if seen.insert(event.event_id.clone()) {
                timeline.push(event);
            }
        }

        if timeline.len() > self.capacity {
            let overflow = timeline.len() - self.capacity;
            timeline.drain(0..overflow);
            debug!(
                room_id = %room_id.0,
                evicted = overflow,
                "timeline: evicted oldest events past capacity"
            );
        }

        timeline.clone()
    }

    pub async fn store_decrypted(&self, room_id: &RoomId, event: MessageEvent) {
        let mut guard = self.rooms.lock().await;
        let Some(timeline) = guard.get_mut(room_id) else {
            return;
        };
        if let Some(slot) = timeline
            .iter_mut()
            .find(|cached| cached.event_id == event.event_id)
        {
            *slot = event;
        }
    }
}
