use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::{DeviceId, UserId};
use tokio::sync::Mutex;

/// Authenticated context for one logged-in device, passed along explicitly;
/// nothing reads it from globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub homeserver: String,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub access_token: String,
}

/// Opaque persistence for session credentials; login flows live with the
/// embedding application.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// In-memory store used by tests and short-lived tools.
#[derive(Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<Session>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().await = None;
        Ok(())
    }
}
