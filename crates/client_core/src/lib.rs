use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{EventId, RoomId, TransactionId},
    protocol::{
        MessageEvent, MessagesPage, RoomEncryptionState, RoomMessageContent, SendMessageResponse,
        ALGORITHM_MEGOLM, EVENT_TYPE_ENCRYPTED, EVENT_TYPE_MESSAGE, MSGTYPE_TEXT,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod config;
pub mod decrypt;
pub mod engine;
pub mod resync;
pub mod retry;
pub mod session;
pub mod throttle;
pub mod timeline;
pub mod transport;

pub use config::ClientConfig;
pub use decrypt::{DecryptOutcome, UndecryptableReason};
pub use engine::{CryptoEngine, EngineError, MissingCryptoEngine, TrustPolicy};
pub use retry::RetryPolicy;
pub use session::{MemorySessionStore, Session, SessionStore};
pub use transport::{HttpTransport, Transport};

use decrypt::EventDecryptor;
use timeline::TimelineCache;

/// Best-effort notifications for embedding UIs.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageDecrypted {
        room_id: RoomId,
        event_id: EventId,
    },
    RoomKeyRequested {
        room_id: RoomId,
        event_id: EventId,
    },
    MessageSent {
        room_id: RoomId,
        event_id: EventId,
    },
    Error(String),
}

enum SendContent {
    Plain(Value),
    Encrypted(Value),
}

impl SendContent {
    fn event_type(&self) -> &'static str {
        match self {
            SendContent::Plain(_) => EVENT_TYPE_MESSAGE,
            SendContent::Encrypted(_) => EVENT_TYPE_ENCRYPTED,
        }
    }

    fn content(&self) -> &Value {
        match self {
            SendContent::Plain(content) | SendContent::Encrypted(content) => content,
        }
    }
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn room_messages(&self, room_id: &RoomId, skip_decryption: bool) -> Vec<MessageEvent>;
    async fn send_message(&self, room_id: &RoomId, body: &str, skip_encryption_setup: bool)
        -> bool;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

/// Room timeline client: fetches history, keeps the bounded per-room cache,
/// resolves encrypted events and sends messages.
pub struct RoomClient {
    transport: Arc<dyn Transport>,
    session: Session,
    engine: Option<Arc<dyn CryptoEngine>>,
    decryptor: Option<EventDecryptor>,
    cache: TimelineCache,
    config: ClientConfig,
    room_locks: Mutex<HashMap<RoomId, Arc<Mutex<()>>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl RoomClient {
    pub fn new(transport: Arc<dyn Transport>, session: Session) -> Arc<Self> {
        Self::new_with_config(transport, session, None, ClientConfig::default())
    }

    pub fn new_with_engine(
        transport: Arc<dyn Transport>,
        session: Session,
        engine: Arc<dyn CryptoEngine>,
    ) -> Arc<Self> {
        Self::new_with_config(transport, session, Some(engine), ClientConfig::default())
    }

    pub fn new_with_config(
        transport: Arc<dyn Transport>,
        session: Session,
        engine: Option<Arc<dyn CryptoEngine>>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let decryptor = engine.clone().map(|engine| {
            EventDecryptor::new(engine, transport.clone(), config.clone(), events.clone())
        });
        Arc::new(Self {
            transport,
            session,
            engine,
            decryptor,
            cache: TimelineCache::new(config.cache_capacity),
            config,
            room_locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    // One pipeline invocation per room at a time; different rooms run in
    // parallel.
    async fn room_pipeline_lock(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        self.room_locks
            .lock()
            .await
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fetch, merge, decrypt. Network trouble degrades to the cached view;
    /// this call does not fail.
    pub async fn room_messages(&self, room_id: &RoomId, skip_decryption: bool) -> Vec<MessageEvent> {
        let lock = self.room_pipeline_lock(room_id).await;
        let _guard = lock.lock().await;

        let merged = match self.fetch_latest_page(room_id).await {
            Ok(fetched) => self.cache.merge(room_id, fetched).await,
            Err(err) => {
                warn!(
                    room_id = %room_id.0,
                    error = %err,
                    "timeline: fetch failed, serving cached events"
                );
                return self.cache.get(room_id).await;
            }
        };

        if skip_decryption {
            return merged;
        }
        let Some(decryptor) = &self.decryptor else {
            return merged;
        };

        let resolutions = decryptor
            .decrypt_timeline(&self.session, room_id, merged)
            .await;
        let mut timeline = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            if resolution.decrypted {
                self.cache
                    .store_decrypted(room_id, resolution.event.clone())
                    .await;
            }
            timeline.push(resolution.event);
        }
        timeline
    }

    async fn fetch_latest_page(&self, room_id: &RoomId) -> Result<Vec<MessageEvent>> {
        let path = format!("/_matrix/client/v3/rooms/{}/messages", room_id.as_str());
        let query = vec![
            ("dir".to_string(), "b".to_string()),
            ("limit".to_string(), self.config.page_limit.to_string()),
        ];
        let response = self
            .transport
            .get(&path, &query, &self.session.access_token)
            .await
            .context("history fetch failed")?;
        if !response.is_success() {
            match response.api_error() {
                Some(api_error) => return Err(anyhow!("history fetch rejected: {api_error}")),
                None => {
                    return Err(anyhow!(
                        "history fetch returned status {}",
                        response.status
                    ))
                }
            }
        }

        let page: MessagesPage =
            serde_json::from_value(response.body).context("history page was not valid json")?;
        let mut chunk = page.chunk;
        // The server pages backward from the newest event.
        chunk.reverse();

        let mut fetched = Vec::with_capacity(chunk.len());
        for entry in chunk {
            match serde_json::from_value::<MessageEvent>(entry) {
                Ok(event) => fetched.push(event),
                Err(err) => {
                    debug!(
                        room_id = %room_id.0,
                        error = %err,
                        "timeline: skipped an undecodable timeline entry"
                    );
                }
            }
        }
        Ok(fetched)
    }

    /// A room advertised as encrypted never receives plaintext: every failure
    /// on the setup or encrypt path drops the send and returns false.
    pub async fn send_message(
        &self,
        room_id: &RoomId,
        body: &str,
        skip_encryption_setup: bool,
    ) -> bool {
        let lock = self.room_pipeline_lock(room_id).await;
        let _guard = lock.lock().await;

        let encrypted_room = match self.room_encryption_state(room_id).await {
            Ok(encrypted) => encrypted,
            Err(err) => {
                warn!(
                    room_id = %room_id.0,
                    error = %err,
                    "send: could not determine room encryption state, refusing to send"
                );
                return false;
            }
        };

        let outgoing = if encrypted_room {
            let Some(engine) = &self.engine else {
                warn!(
                    room_id = %room_id.0,
                    "send: room is encrypted but no crypto engine is attached"
                );
                return false;
            };
            match self
                .encrypt_for_room(engine.as_ref(), room_id, body, skip_encryption_setup)
                .await
            {
                Ok(content) => SendContent::Encrypted(content),
                Err(err) => {
                    warn!(
                        room_id = %room_id.0,
                        error = %err,
                        "send: encryption failed, message not sent"
                    );
                    let _ = self.events.send(ClientEvent::Error(err.to_string()));
                    return false;
                }
            }
        } else {
            match serde_json::to_value(RoomMessageContent::text(body)) {
                Ok(content) => SendContent::Plain(content),
                Err(err) => {
                    warn!(room_id = %room_id.0, error = %err, "send: could not build message body");
                    return false;
                }
            }
        };

        match self.transmit(room_id, &outgoing).await {
            Ok(event_id) => {
                info!(room_id = %room_id.0, event_id = %event_id.0, "send: message delivered");
                let _ = self.events.send(ClientEvent::MessageSent {
                    room_id: room_id.clone(),
                    event_id,
                });
                true
            }
            Err(err) => {
                warn!(room_id = %room_id.0, error = %err, "send: transmit failed");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                false
            }
        }
    }

    // Only a definite 404 on the state lookup means plaintext; any other
    // failure refuses the send rather than guessing.
    async fn room_encryption_state(&self, room_id: &RoomId) -> Result<bool> {
        let path = format!(
            "/_matrix/client/v3/rooms/{}/state/m.room.encryption",
            room_id.as_str()
        );
        let response = self
            .transport
            .get(&path, &[], &self.session.access_token)
            .await
            .context("encryption state lookup failed")?;
        if response.status == 404 {
            return Ok(false);
        }
        if !response.is_success() {
            return Err(anyhow!(
                "encryption state lookup returned status {}",
                response.status
            ));
        }
        let state: RoomEncryptionState =
            serde_json::from_value(response.body).context("encryption state was not valid json")?;
        match state.algorithm.as_deref() {
            Some(ALGORITHM_MEGOLM) | None => Ok(true),
            Some(other) => Err(anyhow!("room uses unsupported algorithm {other}")),
        }
    }

    async fn encrypt_for_room(
        &self,
        engine: &dyn CryptoEngine,
        room_id: &RoomId,
        body: &str,
        skip_encryption_setup: bool,
    ) -> Result<Value> {
        if !skip_encryption_setup {
            engine
                .setup_room_encryption(room_id)
                .await
                .context("encryption setup failed")?;
        }

        let payload = json!({
            "msgtype": MSGTYPE_TEXT,
            "body": body,
        });

        if self.config.probe_before_encrypt {
            let probe = json!({ "msgtype": MSGTYPE_TEXT, "body": "" });
            if let Err(error) = engine.encrypt(room_id, EVENT_TYPE_MESSAGE, &probe).await {
                return match error.normalized() {
                    EngineError::SessionExpired => {
                        self.renew_and_encrypt(engine, room_id, &payload).await
                    }
                    other => Err(anyhow::Error::new(other).context("encryption probe failed")),
                };
            }
        }

        match engine.encrypt(room_id, EVENT_TYPE_MESSAGE, &payload).await {
            Ok(content) => Ok(serde_json::to_value(content)?),
            Err(error) => match error.normalized() {
                EngineError::SessionExpired => {
                    self.renew_and_encrypt(engine, room_id, &payload).await
                }
                other => Err(anyhow::Error::new(other).context("encryption failed")),
            },
        }
    }

    async fn renew_and_encrypt(
        &self,
        engine: &dyn CryptoEngine,
        room_id: &RoomId,
        payload: &Value,
    ) -> Result<Value> {
        info!(room_id = %room_id.0, "e2ee: outbound session expired, renewing before send");
        engine
            .renew_room_session(room_id)
            .await
            .context("session renewal failed")?;
        tokio::time::sleep(self.config.send_renewal_delay).await;
        let content = engine
            .encrypt(room_id, EVENT_TYPE_MESSAGE, payload)
            .await
            .context("encryption failed after session renewal")?;
        Ok(serde_json::to_value(content)?)
    }

    async fn transmit(&self, room_id: &RoomId, outgoing: &SendContent) -> Result<EventId> {
        // A fresh txn id makes a server-side retry of the same send safe.
        let txn_id = TransactionId::fresh();
        let path = format!(
            "/_matrix/client/v3/rooms/{}/send/{}/{}",
            room_id.as_str(),
            outgoing.event_type(),
            txn_id.as_str()
        );
        let response = self
            .transport
            .put(&path, outgoing.content(), &self.session.access_token)
            .await
            .context("send request failed")?;
        if !response.is_success() {
            match response.api_error() {
                Some(api_error) => return Err(anyhow!("send rejected: {api_error}")),
                None => return Err(anyhow!("send returned status {}", response.status)),
            }
        }
        let body: SendMessageResponse =
            serde_json::from_value(response.body).context("send response was not valid json")?;
        Ok(body.event_id)
    }
}

#[async_trait]
impl ClientHandle for Arc<RoomClient> {
    async fn room_messages(&self, room_id: &RoomId, skip_decryption: bool) -> Vec<MessageEvent> {
        RoomClient::room_messages(self, room_id, skip_decryption).await
    }

    async fn send_message(
        &self,
        room_id: &RoomId,
        body: &str,
        skip_encryption_setup: bool,
    ) -> bool {
        RoomClient::send_message(self, room_id, body, skip_encryption_setup).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        RoomClient::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
