use std::sync::Arc;

use anyhow::{anyhow, Context};
use shared::protocol::SyncResponse;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transport::Transport;

const SYNC_PATH: &str = "/_matrix/client/v3/sync";
const SYNC_LONG_POLL_MS: u64 = 1_000;

/// Drives short /sync rounds against the homeserver so that room keys
/// delivered to-device become visible to the crypto engine.
pub struct SyncCoordinator {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    next_batch: Mutex<Option<String>>,
}

impl SyncCoordinator {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            next_batch: Mutex::new(None),
        }
    }

    /// Every attempt in the policy runs even after failures; true when any
    /// attempt completed a round.
    pub async fn resync_for_keys(&self, session: &Session) -> bool {
        let mut any_succeeded = false;
        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt - 1)).await;
            }
            match tokio::time::timeout(self.policy.per_attempt_timeout, self.sync_once(session))
                .await
            {
                Ok(Ok(())) => {
                    any_succeeded = true;
                }
                Ok(Err(err)) => {
                    warn!(attempt, error = %err, "sync: resync attempt failed");
                }
                Err(_) => {
                    warn!(attempt, "sync: resync attempt timed out");
                }
            }
        }
        any_succeeded
    }

    async fn sync_once(&self, session: &Session) -> anyhow::Result<()> {
        let mut query = vec![("timeout".to_string(), SYNC_LONG_POLL_MS.to_string())];
        if let Some(since) = self.next_batch.lock().await.clone() {
            query.push(("since".to_string(), since));
        }

        let response = self
            .transport
            .get(SYNC_PATH, &query, &session.access_token)
            .await
            .context("sync request failed")?;
        if !response.is_success() {
            return Err(anyhow!("sync returned status {}", response.status));
        }

        let body: SyncResponse =
            serde_json::from_value(response.body).context("sync response was not valid json")?;
        debug!(next_batch = %body.next_batch, "sync: round complete");
        *self.next_batch.lock().await = Some(body.next_batch);
        Ok(())
    }
}
