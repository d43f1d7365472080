use std::{
    collections::VecDeque,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{DeviceId, EventId, RoomId, SessionId, TransactionId, UserId},
    protocol::{
        EncryptedContent, MessageEvent, ALGORITHM_MEGOLM, EVENT_TYPE_ENCRYPTED,
        EVENT_TYPE_MESSAGE, MSGTYPE_TEXT,
    },
};
use tokio::sync::Mutex;

use crate::config::ClientConfig;
use crate::engine::{
    CryptoEngine, DecryptedPayload, EngineError, IdentityKeys, RoomKeyRequest, ToDeviceRequest,
    TrustPolicy,
};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transport::{HttpResponse, Transport, TransportError};

pub(crate) const TEST_SENDER_KEY: &str = "RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU";

pub(crate) fn test_session() -> Session {
    test_session_at("http://127.0.0.1:0")
}

pub(crate) fn test_session_at(homeserver: &str) -> Session {
    Session {
        homeserver: homeserver.to_string(),
        user_id: UserId::from("@mina:example.org"),
        device_id: DeviceId::from("TESTDEVICE"),
        access_token: "syt_bWluYQ_test_token".to_string(),
    }
}

/// Config with sub-millisecond delays so recovery paths run instantly.
pub(crate) fn fast_config() -> ClientConfig {
    ClientConfig {
        resync: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            per_attempt_timeout: Duration::from_millis(200),
        },
        send_renewal_delay: Duration::from_millis(1),
        ..ClientConfig::default()
    }
}

pub(crate) fn plain_event(id: &str, body: &str) -> MessageEvent {
    MessageEvent {
        event_id: EventId::from(id),
        event_type: EVENT_TYPE_MESSAGE.to_string(),
        sender: UserId::from("@alice:example.org"),
        origin_server_ts: 1_700_000_000_000,
        content: json!({ "msgtype": MSGTYPE_TEXT, "body": body }),
    }
}

pub(crate) fn encrypted_event(id: &str, session_id: &str) -> MessageEvent {
    MessageEvent {
        event_id: EventId::from(id),
        event_type: EVENT_TYPE_ENCRYPTED.to_string(),
        sender: UserId::from("@alice:example.org"),
        origin_server_ts: 1_700_000_000_000,
        content: json!({
            "algorithm": ALGORITHM_MEGOLM,
            "ciphertext": "AwgAEnACgAkLmt6qF84IK++J7UDH2Za1YVchHyprqTqsg",
            "sender_key": TEST_SENDER_KEY,
            "session_id": session_id,
            "device_id": "RJYKSTBOIE",
        }),
    }
}

/// Serialized clear event as a megolm plaintext would carry it.
pub(crate) fn clear_payload(body: &str) -> String {
    json!({
        "type": EVENT_TYPE_MESSAGE,
        "content": { "msgtype": MSGTYPE_TEXT, "body": body },
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: Option<Value>,
}

struct Route {
    method: String,
    fragment: String,
    responses: VecDeque<Result<HttpResponse, TransportError>>,
}

/// Transport fake scripted per path fragment. Unscripted calls succeed with
/// an empty object so tests only spell out the interesting responses.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn enqueue(
        &self,
        method: &str,
        fragment: &str,
        result: Result<HttpResponse, TransportError>,
    ) {
        let mut routes = self.routes.lock().await;
        if let Some(route) = routes
            .iter_mut()
            .find(|route| route.method == method && route.fragment == fragment)
        {
            route.responses.push_back(result);
        } else {
            routes.push(Route {
                method: method.to_string(),
                fragment: fragment.to_string(),
                responses: VecDeque::from([result]),
            });
        }
    }

    pub(crate) async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub(crate) async fn count(&self, method: &str, fragment: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.method == method && call.path.contains(fragment))
            .count()
    }

    async fn dispatch(
        &self,
        method: &'static str,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().await.push(RecordedCall {
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_vec(),
            body: body.cloned(),
        });
        let mut routes = self.routes.lock().await;
        for route in routes.iter_mut() {
            if route.method == method && path.contains(&route.fragment) {
                if let Some(result) = route.responses.pop_front() {
                    return result;
                }
            }
        }
        Ok(HttpResponse {
            status: 200,
            body: json!({}),
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        _bearer: &str,
    ) -> Result<HttpResponse, TransportError> {
        self.dispatch("GET", path, query, None).await
    }

    async fn put(
        &self,
        path: &str,
        body: &Value,
        _bearer: &str,
    ) -> Result<HttpResponse, TransportError> {
        self.dispatch("PUT", path, &[], Some(body)).await
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        _bearer: &str,
    ) -> Result<HttpResponse, TransportError> {
        self.dispatch("POST", path, &[], Some(body)).await
    }
}

/// Crypto engine fake. Responses pop from per-operation scripts; every call
/// is recorded so tests can assert exact call counts.
pub(crate) struct TestCryptoEngine {
    has_key_script: Mutex<VecDeque<bool>>,
    has_key_default: Mutex<bool>,
    decrypt_script: Mutex<VecDeque<Result<DecryptedPayload, EngineError>>>,
    default_plaintext: Mutex<Option<String>>,
    encrypt_script: Mutex<VecDeque<Result<EncryptedContent, EngineError>>>,
    setup_failures: Mutex<VecDeque<EngineError>>,
    renew_failures: Mutex<VecDeque<EngineError>>,
    request_failures: Mutex<VecDeque<EngineError>>,
    with_cancellation: Mutex<bool>,
    decrypt_calls: Mutex<Vec<EventId>>,
    encrypt_calls: Mutex<Vec<Value>>,
    setup_calls: Mutex<Vec<RoomId>>,
    renew_calls: Mutex<Vec<RoomId>>,
    request_calls: Mutex<Vec<EventId>>,
}

impl TestCryptoEngine {
    /// Engine that reports key material but has no scripted responses, so an
    /// unexercised operation fails loudly.
    pub(crate) fn new() -> Self {
        Self {
            has_key_script: Mutex::new(VecDeque::new()),
            has_key_default: Mutex::new(true),
            decrypt_script: Mutex::new(VecDeque::new()),
            default_plaintext: Mutex::new(None),
            encrypt_script: Mutex::new(VecDeque::new()),
            setup_failures: Mutex::new(VecDeque::new()),
            renew_failures: Mutex::new(VecDeque::new()),
            request_failures: Mutex::new(VecDeque::new()),
            with_cancellation: Mutex::new(false),
            decrypt_calls: Mutex::new(Vec::new()),
            encrypt_calls: Mutex::new(Vec::new()),
            setup_calls: Mutex::new(Vec::new()),
            renew_calls: Mutex::new(Vec::new()),
            request_calls: Mutex::new(Vec::new()),
        }
    }

    /// Engine that decrypts everything to a fixed clear payload.
    pub(crate) fn ok() -> Self {
        let mut engine = Self::new();
        *engine.default_plaintext.get_mut() = Some(clear_payload("decrypted hello"));
        engine
    }

    pub(crate) async fn set_has_key(&self, value: bool) {
        *self.has_key_default.lock().await = value;
    }

    pub(crate) async fn push_has_key(&self, value: bool) {
        self.has_key_script.lock().await.push_back(value);
    }

    pub(crate) async fn push_decrypt(&self, result: Result<DecryptedPayload, EngineError>) {
        self.decrypt_script.lock().await.push_back(result);
    }

    pub(crate) async fn push_encrypt(&self, result: Result<EncryptedContent, EngineError>) {
        self.encrypt_script.lock().await.push_back(result);
    }

    pub(crate) async fn fail_setup(&self, error: EngineError) {
        self.setup_failures.lock().await.push_back(error);
    }

    pub(crate) async fn fail_renew(&self, error: EngineError) {
        self.renew_failures.lock().await.push_back(error);
    }

    pub(crate) async fn fail_request(&self, error: EngineError) {
        self.request_failures.lock().await.push_back(error);
    }

    pub(crate) async fn include_cancellation(&self) {
        *self.with_cancellation.lock().await = true;
    }

    pub(crate) async fn decrypt_count(&self) -> usize {
        self.decrypt_calls.lock().await.len()
    }

    pub(crate) async fn encrypt_count(&self) -> usize {
        self.encrypt_calls.lock().await.len()
    }

    pub(crate) async fn encrypted_payloads(&self) -> Vec<Value> {
        self.encrypt_calls.lock().await.clone()
    }

    pub(crate) async fn setup_count(&self) -> usize {
        self.setup_calls.lock().await.len()
    }

    pub(crate) async fn renew_count(&self) -> usize {
        self.renew_calls.lock().await.len()
    }

    pub(crate) async fn request_count(&self) -> usize {
        self.request_calls.lock().await.len()
    }

    pub(crate) fn sample_ciphertext() -> EncryptedContent {
        EncryptedContent {
            algorithm: ALGORITHM_MEGOLM.to_string(),
            ciphertext: "AwgAEnACgAkLmt6qF84IK++J7UDH2Za1YVchHyprqTqsg".to_string(),
            sender_key: TEST_SENDER_KEY.to_string(),
            session_id: SessionId::from("X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ"),
            device_id: Some(DeviceId::from("TESTDEVICE")),
        }
    }

    fn key_request(with_cancellation: bool) -> RoomKeyRequest {
        let cancellation = with_cancellation.then(|| ToDeviceRequest {
            event_type: "m.room_key_request".to_string(),
            txn_id: TransactionId::fresh(),
            messages: json!({
                "@alice:example.org": { "*": { "action": "request_cancellation" } }
            }),
        });
        RoomKeyRequest {
            request: ToDeviceRequest {
                event_type: "m.room_key_request".to_string(),
                txn_id: TransactionId::fresh(),
                messages: json!({
                    "@alice:example.org": { "*": { "action": "request" } }
                }),
            },
            cancellation,
        }
    }
}

#[async_trait]
impl CryptoEngine for TestCryptoEngine {
    async fn encrypt(
        &self,
        _room_id: &RoomId,
        _event_type: &str,
        content: &Value,
    ) -> Result<EncryptedContent, EngineError> {
        self.encrypt_calls.lock().await.push(content.clone());
        match self.encrypt_script.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(Self::sample_ciphertext()),
        }
    }

    async fn decrypt(
        &self,
        _room_id: &RoomId,
        event: &MessageEvent,
        _trust: TrustPolicy,
    ) -> Result<DecryptedPayload, EngineError> {
        self.decrypt_calls.lock().await.push(event.event_id.clone());
        if let Some(result) = self.decrypt_script.lock().await.pop_front() {
            return result;
        }
        match self.default_plaintext.lock().await.clone() {
            Some(plaintext) => Ok(DecryptedPayload {
                plaintext,
                sender_key: TEST_SENDER_KEY.to_string(),
            }),
            None => Err(EngineError::Failure("unscripted decrypt".to_string())),
        }
    }

    async fn has_room_key(&self, _room_id: &RoomId) -> bool {
        if let Some(value) = self.has_key_script.lock().await.pop_front() {
            return value;
        }
        *self.has_key_default.lock().await
    }

    async fn request_room_key(
        &self,
        _room_id: &RoomId,
        event: &MessageEvent,
    ) -> Result<RoomKeyRequest, EngineError> {
        self.request_calls.lock().await.push(event.event_id.clone());
        if let Some(error) = self.request_failures.lock().await.pop_front() {
            return Err(error);
        }
        Ok(Self::key_request(*self.with_cancellation.lock().await))
    }

    async fn identity_keys(&self) -> Result<IdentityKeys, EngineError> {
        Ok(IdentityKeys {
            curve25519: TEST_SENDER_KEY.to_string(),
            ed25519: "4VjV3OhFUxWFAcO5YOaQVmTIn29JdRmodFKE4NPNmJY".to_string(),
        })
    }

    async fn setup_room_encryption(&self, room_id: &RoomId) -> Result<(), EngineError> {
        self.setup_calls.lock().await.push(room_id.clone());
        match self.setup_failures.lock().await.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn renew_room_session(&self, room_id: &RoomId) -> Result<(), EngineError> {
        self.renew_calls.lock().await.push(room_id.clone());
        match self.renew_failures.lock().await.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
