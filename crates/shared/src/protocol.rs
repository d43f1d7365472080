use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{DeviceId, EventId, SessionId, UserId};

pub const ALGORITHM_MEGOLM: &str = "m.megolm.v1.aes-sha2";
pub const EVENT_TYPE_MESSAGE: &str = "m.room.message";
pub const EVENT_TYPE_ENCRYPTED: &str = "m.room.encrypted";
pub const MSGTYPE_TEXT: &str = "m.text";
/// Marker msgtype for timeline entries that could not be decrypted.
pub const MSGTYPE_BAD_ENCRYPTED: &str = "m.bad.encrypted";

/// One timeline event as the homeserver serves it. `content` stays untyped
/// because event types carry arbitrary shapes; encrypted events parse their
/// content into [`EncryptedContent`] on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: UserId,
    pub origin_server_ts: i64,
    pub content: Value,
}

impl MessageEvent {
    pub fn is_encrypted(&self) -> bool {
        self.event_type == EVENT_TYPE_ENCRYPTED
    }
}

/// Response page from `GET /rooms/{room_id}/messages`. Entries stay raw so a
/// single malformed event cannot poison the whole page.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesPage {
    pub chunk: Vec<Value>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// Megolm envelope carried in the content of an `m.room.encrypted` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedContent {
    pub algorithm: String,
    pub ciphertext: String,
    pub sender_key: String,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// Plain-text message body for unencrypted rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMessageContent {
    pub msgtype: String,
    pub body: String,
}

impl RoomMessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: MSGTYPE_TEXT.to_string(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResponse {
    pub event_id: EventId,
}

/// Body shape for `PUT /sendToDevice/{event_type}/{txn_id}`. The inner map is
/// keyed by user id, then device id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToDeviceEnvelope {
    pub messages: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
}

/// Content of the `m.room.encryption` state event.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomEncryptionState {
    #[serde(default)]
    pub algorithm: Option<String>,
}
