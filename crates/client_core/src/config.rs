use std::time::Duration;

use crate::engine::TrustPolicy;
use crate::retry::RetryPolicy;

const DEFAULT_PAGE_LIMIT: u32 = 50;
const DEFAULT_CACHE_CAPACITY: usize = 100;
const KEY_REQUEST_MIN_INTERVAL: Duration = Duration::from_secs(30);
const KEY_REQUEST_RETENTION: Duration = Duration::from_secs(5 * 60);
const SEND_RENEWAL_DELAY: Duration = Duration::from_millis(500);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for one client instance, fixed at construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub page_limit: u32,
    pub cache_capacity: usize,
    pub throttle_window: Duration,
    pub throttle_retention: Duration,
    /// Attempt schedule for targeted re-syncs after a key request.
    pub resync: RetryPolicy,
    pub send_renewal_delay: Duration,
    /// Encrypt a throwaway payload before the real one to surface a stale
    /// outbound session early.
    pub probe_before_encrypt: bool,
    pub trust: TrustPolicy,
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            throttle_window: KEY_REQUEST_MIN_INTERVAL,
            throttle_retention: KEY_REQUEST_RETENTION,
            resync: RetryPolicy::default(),
            send_renewal_delay: SEND_RENEWAL_DELAY,
            probe_before_encrypt: false,
            trust: TrustPolicy::AllowUnverified,
            http_timeout: HTTP_TIMEOUT,
        }
    }
}
