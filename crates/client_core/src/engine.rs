use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{RoomId, TransactionId},
    protocol::{EncryptedContent, MessageEvent},
};
use thiserror::Error;

/// Whether decryption may use sessions from unverified devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    AllowUnverified,
    VerifiedOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    pub curve25519: String,
    pub ed25519: String,
}

/// Recovered clear text plus the curve25519 key of the sending device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPayload {
    pub plaintext: String,
    pub sender_key: String,
}

#[derive(Debug, Clone)]
pub struct ToDeviceRequest {
    pub event_type: String,
    pub txn_id: TransactionId,
    pub messages: Value,
}

/// A room-key request, optionally preceded by a cancellation of an earlier
/// one.
#[derive(Debug, Clone)]
pub struct RoomKeyRequest {
    pub request: ToDeviceRequest,
    pub cancellation: Option<ToDeviceRequest>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no usable room key for this event")]
    MissingRoomKey,
    #[error("encryption session has expired")]
    SessionExpired,
    #[error("event payload is malformed")]
    Malformed,
    #[error("crypto engine unavailable")]
    Unavailable,
    #[error("{0}")]
    Failure(String),
}

impl EngineError {
    /// Maps an unstructured failure string onto the structured variants, so
    /// the rest of the pipeline never inspects raw text.
    pub fn classify(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        if lowered.contains("unknown session")
            || lowered.contains("no session")
            || lowered.contains("missing session")
            || lowered.contains("unknown message index")
            || lowered.contains("room key")
        {
            EngineError::MissingRoomKey
        } else if lowered.contains("expired")
            || lowered.contains("wrong epoch")
            || lowered.contains("rotated")
            || lowered.contains("outdated")
        {
            EngineError::SessionExpired
        } else if lowered.contains("malformed")
            || lowered.contains("invalid base64")
            || lowered.contains("unable to parse")
        {
            EngineError::Malformed
        } else if lowered.contains("unavailable") || lowered.contains("not initialized") {
            EngineError::Unavailable
        } else {
            EngineError::Failure(raw.to_string())
        }
    }

    // Structured variants pass through unchanged.
    pub(crate) fn normalized(self) -> Self {
        match self {
            EngineError::Failure(detail) => EngineError::classify(&detail),
            other => other,
        }
    }
}

/// Boundary to the end-to-end encryption engine; the pipeline only
/// orchestrates calls.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptedContent, EngineError>;

    async fn decrypt(
        &self,
        room_id: &RoomId,
        event: &MessageEvent,
        trust: TrustPolicy,
    ) -> Result<DecryptedPayload, EngineError>;

    async fn has_room_key(&self, room_id: &RoomId) -> bool;

    async fn request_room_key(
        &self,
        room_id: &RoomId,
        event: &MessageEvent,
    ) -> Result<RoomKeyRequest, EngineError>;

    async fn identity_keys(&self) -> Result<IdentityKeys, EngineError>;

    async fn setup_room_encryption(&self, room_id: &RoomId) -> Result<(), EngineError>;

    /// Discards the outbound session for the room and creates a new one.
    async fn renew_room_session(&self, room_id: &RoomId) -> Result<(), EngineError>;
}

/// Placeholder engine for clients whose crypto backend has not come up.
pub struct MissingCryptoEngine;

#[async_trait]
impl CryptoEngine for MissingCryptoEngine {
    async fn encrypt(
        &self,
        _room_id: &RoomId,
        _event_type: &str,
        _content: &Value,
    ) -> Result<EncryptedContent, EngineError> {
        Err(EngineError::Unavailable)
    }

    async fn decrypt(
        &self,
        _room_id: &RoomId,
        _event: &MessageEvent,
        _trust: TrustPolicy,
    ) -> Result<DecryptedPayload, EngineError> {
        Err(EngineError::Unavailable)
    }

    async fn has_room_key(&self, _room_id: &RoomId) -> bool {
        false
    }

    async fn request_room_key(
        &self,
        _room_id: &RoomId,
        _event: &MessageEvent,
    ) -> Result<RoomKeyRequest, EngineError> {
        Err(EngineError::Unavailable)
    }

    async fn identity_keys(&self) -> Result<IdentityKeys, EngineError> {
        Err(EngineError::Unavailable)
    }

    async fn setup_room_encryption(&self, _room_id: &RoomId) -> Result<(), EngineError> {
        Err(EngineError::Unavailable)
    }

    async fn renew_room_session(&self, _room_id: &RoomId) -> Result<(), EngineError> {
        Err(EngineError::Unavailable)
    }
}
