use std::fmt;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_WS_URL: &str = "wss://api.mainnet-beta.solana.com";
pub const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_MIN_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 12;
pub const DEFAULT_EVENT_BUFFER: usize = 2048;
pub const DEFAULT_BUNDLE_WINDOW_MS: u64 = 25;
pub const DEFAULT_BUNDLE_MAX_BATCH: usize = 64;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SAMPLE_WINDOW_MS: u64 = 200;
pub const DEFAULT_BACKPRESSURE_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_MAX_PENDING_NOTIFICATIONS: usize = 4_096;

#[derive(Clone, Debug)]
pub struct LeashConfig {
    pub ws_url: String,
    pub ping_interval_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
    pub event_buffer: usize,
    pub bundle_window_ms: u64,
    pub bundle_max_batch: usize,
    pub poll_interval_ms: u64,
    pub policy: NotificationPolicy,
}

impl Default for LeashConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            min_backoff_ms: DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            bundle_window_ms: DEFAULT_BUNDLE_WINDOW_MS,
            bundle_max_batch: DEFAULT_BUNDLE_MAX_BATCH,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            policy: NotificationPolicy::default(),
        }
    }
}

/// Delivery policy applied by the notification router. Swappable at runtime
/// through [`ClientCommand::UpdatePolicy`] without restarting the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPolicy {
    pub sample_window_ms: u64,
    pub backpressure_window_ms: u64,
    /// Keys matching one of these prefixes are forwarded frame-by-frame and
    /// never coalesced by sampling.
    pub critical_key_prefixes: Vec<String>,
    pub max_pending_notifications: usize,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            sample_window_ms: DEFAULT_SAMPLE_WINDOW_MS,
            backpressure_window_ms: DEFAULT_BACKPRESSURE_WINDOW_MS,
            critical_key_prefixes: vec!["sig:".to_string(), "acct:".to_string()],
            max_pending_notifications: DEFAULT_MAX_PENDING_NOTIFICATIONS,
        }
    }
}

impl NotificationPolicy {
    pub fn is_critical(&self, key: &str) -> bool {
        self.critical_key_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting(u32),
    GaveUp,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting ({attempt})"),
            ConnectionState::GaveUp => write!(f, "gave up"),
        }
    }
}

#[derive(Debug)]
pub enum ClientCommand {
    /// Force a fresh connection attempt, resetting the backoff counter. The
    /// only way out of [`ConnectionState::GaveUp`].
    Reconnect,
    UpdatePolicy(NotificationPolicy),
    Close,
}

/// Read-only view of one registry entry, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub key: String,
    pub method: String,
    pub wire_id: Option<u64>,
    pub ref_count: usize,
    pub created_order: u64,
}
