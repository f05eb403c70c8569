//! Two-axis rate limiting for NIP-46 traffic: failed RPC calls by IP,
//! successful bunker calls by client pubkey. Negative buckets: every use
//! adds one, a background task drains them on a fixed cadence, and a
//! bucket at its burst ceiling blocks.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

const IP_FAILED_MAX_BURST: i32 = 10;
const IP_FAILED_REFILL: i32 = 2;

const CLIENT_SUCCESS_MAX_BURST: i32 = 50;
const CLIENT_SUCCESS_REFILL: i32 = 3;

const REFILL_INTERVAL: Duration = Duration::from_secs(3 * 60);

#[derive(Default)]
pub struct RateLimits {
    ip_failed: DashMap<String, AtomicI32>,
    client_success: DashMap<String, AtomicI32>,
}

impl RateLimits {
    pub fn new() -> Self {
        RateLimits::default()
    }

    /// Count one failed RPC attempt from this IP.
    pub fn note_ip_failure(&self, ip: &str) {
        self.ip_failed
            .entry(ip.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// True when this IP has to be blocked.
    pub fn ip_blocked(&self, ip: &str) -> bool {
        self.ip_failed
            .get(ip)
            .map(|bucket| bucket.load(Ordering::Relaxed) >= IP_FAILED_MAX_BURST)
            .unwrap_or(false)
    }

    /// Count one successful bunker call from this client.
    pub fn note_client_success(&self, client_pubkey: &str) {
        self.client_success
            .entry(client_pubkey.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// True when this client has to be blocked.
    pub fn client_blocked(&self, client_pubkey: &str) -> bool {
        self.client_success
            .get(client_pubkey)
            .map(|bucket| bucket.load(Ordering::Relaxed) >= CLIENT_SUCCESS_MAX_BURST)
            .unwrap_or(false)
    }

    /// One refill tick; exposed for tests, normally driven by
    /// [`run_refill`].
    pub fn refill(&self) {
        self.ip_failed
            .retain(|_, bucket| bucket.fetch_sub(IP_FAILED_REFILL, Ordering::Relaxed) > IP_FAILED_REFILL);
        self.client_success.retain(|_, bucket| {
            bucket.fetch_sub(CLIENT_SUCCESS_REFILL, Ordering::Relaxed) > CLIENT_SUCCESS_REFILL
        });
    }
}

/// Background refill loop; spawn once at startup.
pub async fn run_refill(coordinator: Arc<crate::relay::Coordinator>) {
    let mut interval = tokio::time::interval(REFILL_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        coordinator.rate_limits.refill();
    }
}
