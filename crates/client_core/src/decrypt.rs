use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    domain::RoomId,
    protocol::{
        EncryptedContent, MessageEvent, ToDeviceEnvelope, ALGORITHM_MEGOLM, EVENT_TYPE_MESSAGE,
        MSGTYPE_BAD_ENCRYPTED, MSGTYPE_TEXT,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::engine::{CryptoEngine, DecryptedPayload, EngineError, ToDeviceRequest};
use crate::resync::SyncCoordinator;
use crate::session::Session;
use crate::throttle::KeyRequestThrottle;
use crate::transport::Transport;
use crate::ClientEvent;

/// Why an encrypted event stayed encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndecryptableReason {
    MissingKey,
    SessionExpired,
    MalformedEvent,
    EngineUnavailable,
    Other(String),
}

impl UndecryptableReason {
    pub fn code(&self) -> &'static str {
        match self {
            UndecryptableReason::MissingKey => "missing_key",
            UndecryptableReason::SessionExpired => "session_expired",
            UndecryptableReason::MalformedEvent => "malformed_event",
            UndecryptableReason::EngineUnavailable => "engine_unavailable",
            UndecryptableReason::Other(_) => "other",
        }
    }

    fn detail(&self) -> &str {
        match self {
            UndecryptableReason::MissingKey => "the room key has not arrived",
            UndecryptableReason::SessionExpired => "the sender's encryption session expired",
            UndecryptableReason::MalformedEvent => "the encrypted payload is malformed",
            UndecryptableReason::EngineUnavailable => "the encryption engine is unavailable",
            UndecryptableReason::Other(detail) => detail,
        }
    }

    fn from_engine(error: EngineError) -> Self {
        match error {
            EngineError::MissingRoomKey => UndecryptableReason::MissingKey,
            EngineError::SessionExpired => UndecryptableReason::SessionExpired,
            EngineError::Malformed => UndecryptableReason::MalformedEvent,
            EngineError::Unavailable => UndecryptableReason::EngineUnavailable,
            EngineError::Failure(detail) => UndecryptableReason::Other(detail),
        }
    }
}

/// Terminal state for one encrypted event; nothing is dropped or left
/// pending.
#[derive(Debug)]
pub enum DecryptOutcome {
    Decrypted(MessageEvent),
    Undecryptable(UndecryptableReason),
}

// `decrypted` marks events whose clear form should replace the cached
// ciphertext copy.
#[derive(Debug)]
pub(crate) struct TimelineResolution {
    pub(crate) event: MessageEvent,
    pub(crate) decrypted: bool,
}

pub(crate) struct EventDecryptor {
    engine: Arc<dyn CryptoEngine>,
    transport: Arc<dyn Transport>,
    throttle: KeyRequestThrottle,
    resync: SyncCoordinator,
    config: ClientConfig,
    events: broadcast::Sender<ClientEvent>,
}

impl EventDecryptor {
    pub(crate) fn new(
        engine: Arc<dyn CryptoEngine>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let throttle = KeyRequestThrottle::new(config.throttle_window, config.throttle_retention);
        let resync = SyncCoordinator::new(transport.clone(), config.resync.clone());
        Self {
            engine,
            transport,
            throttle,
            resync,
            config,
            events,
        }
    }

    /// Output length and order match the input; events that stay encrypted
    /// are swapped for a tagged placeholder in the returned view only.
    pub(crate) async fn decrypt_timeline(
        &self,
        session: &Session,
        room_id: &RoomId,
        events: Vec<MessageEvent>,
    ) -> Vec<TimelineResolution> {
        let mut resolved = Vec::with_capacity(events.len());
        let mut engine_down = false;
        for event in events {
            if !event.is_encrypted() {
                resolved.push(TimelineResolution {
                    event,
                    decrypted: false,
                });
                continue;
            }
            if engine_down {
                resolved.push(TimelineResolution {
                    event: placeholder(&event, &UndecryptableReason::EngineUnavailable),
                    decrypted: false,
                });
                continue;
            }
            match self.resolve_event(session, room_id, &event).await {
                DecryptOutcome::Decrypted(clear) => {
                    let _ = self.events.send(ClientEvent::MessageDecrypted {
                        room_id: room_id.clone(),
                        event_id: clear.event_id.clone(),
                    });
                    resolved.push(TimelineResolution {
                        event: clear,
                        decrypted: true,
                    });
                }
                DecryptOutcome::Undecryptable(reason) => {
                    if reason == UndecryptableReason::EngineUnavailable {
                        engine_down = true;
                    }
                    warn!(
                        room_id = %room_id.0,
                        event_id = %event.event_id.0,
                        reason = reason.code(),
                        "e2ee: event left undecryptable"
                    );
                    resolved.push(TimelineResolution {
                        event: placeholder(&event, &reason),
                        decrypted: false,
                    });
                }
            }
        }
        resolved
    }

    // At most one recovery (key request or session renewal) runs per event,
    // followed by at most one more decryption attempt.
    async fn resolve_event(
        &self,
        session: &Session,
        room_id: &RoomId,
        event: &MessageEvent,
    ) -> DecryptOutcome {
        let envelope: EncryptedContent = match serde_json::from_value(event.content.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(
                    event_id = %event.event_id.0,
                    error = %err,
                    "e2ee: encrypted event is missing cipher fields"
                );
                return DecryptOutcome::Undecryptable(UndecryptableReason::MalformedEvent);
            }
        };
        if envelope.algorithm != ALGORITHM_MEGOLM {
            return DecryptOutcome::Undecryptable(UndecryptableReason::Other(format!(
                "unsupported algorithm {}",
                envelope.algorithm
            )));
        }

        if !self.engine.has_room_key(room_id).await {
            return self.recover_missing_key(session, room_id, event).await;
        }

        match self.try_decrypt(room_id, event).await {
            Ok(clear) => DecryptOutcome::Decrypted(clear),
            Err(error) => match error.normalized() {
                EngineError::MissingRoomKey => {
                    self.recover_missing_key(session, room_id, event).await
                }
                EngineError::SessionExpired => self.recover_expired_session(room_id, event).await,
                other => DecryptOutcome::Undecryptable(UndecryptableReason::from_engine(other)),
            },
        }
    }

    async fn recover_missing_key(
        &self,
        session: &Session,
        room_id: &RoomId,
        event: &MessageEvent,
    ) -> DecryptOutcome {
        if !self
            .throttle
            .should_request(room_id, &event.sender, &event.event_id)
            .await
        {
            debug!(
                room_id = %room_id.0,
                event_id = %event.event_id.0,
                "e2ee: key request suppressed inside the throttle window"
            );
            return DecryptOutcome::Undecryptable(UndecryptableReason::MissingKey);
        }

        let request = match self.engine.request_room_key(room_id, event).await {
            Ok(request) => request,
            Err(error) => {
                warn!(error = %error, "e2ee: engine could not build a key request");
                let reason = match error.normalized() {
                    EngineError::Unavailable => UndecryptableReason::EngineUnavailable,
                    _ => UndecryptableReason::MissingKey,
                };
                return DecryptOutcome::Undecryptable(reason);
            }
        };

        if let Some(cancellation) = &request.cancellation {
            if let Err(err) = self.deliver_to_device(session, cancellation).await {
                warn!(error = %err, "e2ee: could not cancel the previous key request");
            }
        }
        if let Err(err) = self.deliver_to_device(session, &request.request).await {
            // The window stays unstarted so the next pass may ask again.
            warn!(error = %err, "e2ee: key request delivery failed");
            return DecryptOutcome::Undecryptable(UndecryptableReason::MissingKey);
        }
        self.throttle
            .record_request(room_id, &event.sender, &event.event_id)
            .await;
        info!(
            room_id = %room_id.0,
            event_id = %event.event_id.0,
            "e2ee: requested room key from the sending device"
        );
        let _ = self.events.send(ClientEvent::RoomKeyRequested {
            room_id: room_id.clone(),
            event_id: event.event_id.clone(),
        });

        if !self.resync.resync_for_keys(session).await {
            debug!(room_id = %room_id.0, "e2ee: no sync round completed after the key request");
        }

        if !self.engine.has_room_key(room_id).await {
            return DecryptOutcome::Undecryptable(UndecryptableReason::MissingKey);
        }
        match self.try_decrypt(room_id, event).await {
            Ok(clear) => DecryptOutcome::Decrypted(clear),
            Err(error) => match error.normalized() {
                EngineError::Unavailable => {
                    DecryptOutcome::Undecryptable(UndecryptableReason::EngineUnavailable)
                }
                _ => DecryptOutcome::Undecryptable(UndecryptableReason::MissingKey),
            },
        }
    }

    async fn recover_expired_session(
        &self,
        room_id: &RoomId,
        event: &MessageEvent,
    ) -> DecryptOutcome {
        if let Err(error) = self.engine.renew_room_session(room_id).await {
            warn!(room_id = %room_id.0, error = %error, "e2ee: session renewal failed");
            let reason = match error.normalized() {
                EngineError::Unavailable => UndecryptableReason::EngineUnavailable,
                _ => UndecryptableReason::SessionExpired,
            };
            return DecryptOutcome::Undecryptable(reason);
        }
        info!(room_id = %room_id.0, "e2ee: renewed room session");
        match self.try_decrypt(room_id, event).await {
            Ok(clear) => DecryptOutcome::Decrypted(clear),
            Err(error) => match error.normalized() {
                EngineError::Unavailable => {
                    DecryptOutcome::Undecryptable(UndecryptableReason::EngineUnavailable)
                }
                _ => DecryptOutcome::Undecryptable(UndecryptableReason::SessionExpired),
            },
        }
    }

    async fn try_decrypt(
        &self,
        room_id: &RoomId,
        event: &MessageEvent,
    ) -> Result<MessageEvent, EngineError> {
        let payload = self.engine.decrypt(room_id, event, self.config.trust).await?;
        Ok(clear_event_from(event, &payload))
    }

    async fn deliver_to_device(
        &self,
        session: &Session,
        request: &ToDeviceRequest,
    ) -> anyhow::Result<()> {
        let path = format!(
            "/_matrix/client/v3/sendToDevice/{}/{}",
            request.event_type,
            request.txn_id.as_str()
        );
        let envelope = serde_json::to_value(ToDeviceEnvelope {
            messages: request.messages.clone(),
        })?;
        let response = self
            .transport
            .put(&path, &envelope, &session.access_token)
            .await?;
        if !response.is_success() {
            match response.api_error() {
                Some(api_error) => anyhow::bail!("to-device send rejected: {api_error}"),
                None => anyhow::bail!("to-device send returned status {}", response.status),
            }
        }
        Ok(())
    }
}

/// Clear-event shape carried inside the megolm plaintext.
#[derive(Deserialize)]
struct ClearEvent {
    #[serde(rename = "type")]
    event_type: String,
    content: Value,
}

// A payload that does not decode to a message with a body keeps the raw
// plaintext as the body so the message is not lost.
fn clear_event_from(event: &MessageEvent, payload: &DecryptedPayload) -> MessageEvent {
    let mut clear = event.clone();
    match serde_json::from_str::<ClearEvent>(&payload.plaintext) {
        Ok(inner) if inner.content.get("body").is_some() => {
            clear.event_type = inner.event_type;
            clear.content = inner.content;
        }
        _ => {
            clear.event_type = EVENT_TYPE_MESSAGE.to_string();
            clear.content = json!({
                "msgtype": MSGTYPE_TEXT,
                "body": payload.plaintext,
            });
        }
    }
    clear
}

fn placeholder(event: &MessageEvent, reason: &UndecryptableReason) -> MessageEvent {
    let mut shown = event.clone();
    shown.event_type = EVENT_TYPE_MESSAGE.to_string();
    shown.content = json!({
        "msgtype": MSGTYPE_BAD_ENCRYPTED,
        "body": format!("** Unable to decrypt: {} **", reason.detail()),
        "reason": reason.code(),
    });
    shown
}

#[cfg(test)]
#[path = "tests/decrypt_tests.rs"]
mod tests;
