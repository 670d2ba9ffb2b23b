use chrono::{DateTime, Local};
use serde_json::Value;

/// One delivered notification. `payload` is the raw JSON-RPC `result` value;
/// decoding it into domain types is the consumer's responsibility.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationEvent {
    pub key: String,
    /// Server-assigned subscription id for the current connection epoch.
    /// Zero for notifications synthesized by the fallback poller.
    pub wire_id: u64,
    pub method: String,
    pub payload: Value,
    /// True when the payload went through the latest-value sampling window
    /// (or was synthesized by the fallback poller) rather than being
    /// forwarded frame-by-frame.
    pub sampled: bool,
}

#[derive(Debug)]
pub enum WsEvent {
    Connected(String),
    /// Resubscribe replay after (re)connection completed; notification
    /// delivery has resumed.
    Ready,
    Disconnected(String),
    Reconnecting(u32),
    GaveUp,
    Notification(NotificationEvent),
    /// Aggregated drop report, one per backpressure window in which at least
    /// one frame or event was dropped.
    Backpressure { dropped: u64, window_ms: u64 },
    SubscriptionRejected { key: String, message: String },
    InfoLog(DateTime<Local>, String),
    ErrorLog(DateTime<Local>, String),
    WarnLog(DateTime<Local>, String),
    DebugLog(DateTime<Local>, String),
    Shutdown,
}

impl WsEvent {
    pub fn info<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::InfoLog(Local::now(), msg.into())
    }

    pub fn warn<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::WarnLog(Local::now(), msg.into())
    }

    pub fn error<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::ErrorLog(Local::now(), msg.into())
    }

    pub fn debug<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::DebugLog(Local::now(), msg.into())
    }

    pub fn notification(
        key: String,
        wire_id: u64,
        method: String,
        payload: Value,
        sampled: bool,
    ) -> Self {
        Self::Notification(NotificationEvent {
            key,
            wire_id,
            method,
            payload,
            sampled,
        })
    }

    /// True for events the router must never deliberately drop when the
    /// event buffer is saturated.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            WsEvent::Notification(NotificationEvent { sampled: true, .. })
                | WsEvent::InfoLog(..)
                | WsEvent::DebugLog(..)
        )
    }
}
