use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use shared::domain::{EventId, RoomId, UserId};
use tokio::sync::Mutex;
use tracing::debug;

type RequestKey = (RoomId, UserId, EventId);

/// Drops a repeat key request for the same (room, sender, event) inside the
/// window.
pub struct KeyRequestThrottle {
    window: Duration,
    retention: Duration,
    last_request: Mutex<HashMap<RequestKey, Instant>>,
}

impl KeyRequestThrottle {
    pub fn new(window: Duration, retention: Duration) -> Self {
        Self {
            window,
            retention,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// Does not start the window; call [`Self::record_request`] once the
    /// request was actually delivered.
    pub async fn should_request(&self, room_id: &RoomId, sender: &UserId, event_id: &EventId) -> bool {
        let mut guard = self.last_request.lock().await;
        let before = guard.len();
        guard.retain(|_, sent_at| sent_at.elapsed() < self.retention);
        if guard.len() < before {
            debug!(
                purged = before - guard.len(),
                "e2ee: dropped stale key-request records"
            );
        }

        match guard.get(&(room_id.clone(), sender.clone(), event_id.clone())) {
            Some(sent_at) => sent_at.elapsed() >= self.window,
            None => true,
        }
    }

    pub async fn record_request(&self, room_id: &RoomId, sender: &UserId, event_id: &EventId) {
        self.last_request
            .lock()
            .await
            .insert((room_id.clone(), sender.clone(), event_id.clone()), Instant::now());
    }
}
