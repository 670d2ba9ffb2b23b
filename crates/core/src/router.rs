use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use leash_types::{NotificationPolicy, WsEvent, channel::TrySendError};
use serde_json::Value;
use tokio::{
    select,
    sync::mpsc,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::registry::SubscriptionRegistry;

/// An inbound notification frame, already parsed off the wire but not yet
/// resolved to a logical key.
#[derive(Debug)]
pub(crate) struct RawNotification {
    pub method: String,
    pub subscription: u64,
    pub payload: Value,
}

/// Bounded outward event stream. When the consumer falls behind, droppable
/// events (sampled notifications, info/debug logs) are discarded on arrival
/// and everything else evicts the oldest queued event instead of blocking
/// the read loop; every discard lands in the shared drop counter that feeds
/// `Backpressure` reports.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: leash_types::channel::Sender<WsEvent>,
    rx: leash_types::channel::Receiver<WsEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub fn new(capacity: usize) -> (Self, leash_types::channel::Receiver<WsEvent>) {
        let (tx, rx) = leash_types::channel::bounded(capacity);
        (
            Self {
                tx,
                rx: rx.clone(),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: WsEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                if event.is_droppable() {
                    self.count_drop();
                    return;
                }
                if self.rx.try_recv().is_ok() {
                    self.count_drop();
                }
                if self.tx.try_send(event).is_err() {
                    self.count_drop();
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

struct PendingSample {
    wire_id: u64,
    method: String,
    payload: Value,
}

/// Resolves inbound notifications to logical keys and applies the delivery
/// policy: critical keys are forwarded frame-by-frame in wire order, the
/// rest land in a per-key latest-value slot that is flushed once per sample
/// window. The slot map bounds memory to one payload per distinct key.
pub(crate) struct Router {
    registry: SubscriptionRegistry,
    events: EventSender,
    policy: Arc<RwLock<NotificationPolicy>>,
    pending: HashMap<String, PendingSample>,
}

impl Router {
    pub fn new(
        registry: SubscriptionRegistry,
        events: EventSender,
        policy: Arc<RwLock<NotificationPolicy>>,
    ) -> Self {
        Self {
            registry,
            events,
            policy,
            pending: HashMap::new(),
        }
    }

    pub fn route(&mut self, note: RawNotification) {
        let Some(key) = self.registry.resolve(note.subscription) else {
            debug!(
                "dropping notification for stale subscription id {}",
                note.subscription
            );
            self.events.count_drop();
            return;
        };

        let (critical, max_pending) = {
            let policy = self.policy.read().unwrap();
            (policy.is_critical(&key), policy.max_pending_notifications)
        };

        if critical {
            self.events.emit(WsEvent::notification(
                key,
                note.subscription,
                note.method,
                note.payload,
                false,
            ));
            return;
        }

        if !self.pending.contains_key(&key) && self.pending.len() >= max_pending {
            self.events.count_drop();
            return;
        }
        // Overwrite semantics: only the most recent payload per key survives
        // the window.
        self.pending.insert(
            key,
            PendingSample {
                wire_id: note.subscription,
                method: note.method,
                payload: note.payload,
            },
        );
    }

    pub fn flush_samples(&mut self) {
        for (key, sample) in self.pending.drain() {
            self.events.emit(WsEvent::notification(
                key,
                sample.wire_id,
                sample.method,
                sample.payload,
                true,
            ));
        }
    }

    pub fn report_backpressure(&mut self, window_ms: u64) {
        let dropped = self.events.take_dropped();
        if dropped > 0 {
            warn!("{dropped} notification(s) dropped in the last {window_ms}ms");
            self.events.emit(WsEvent::Backpressure { dropped, window_ms });
        }
    }

    fn windows(&self) -> (Duration, Duration) {
        let policy = self.policy.read().unwrap();
        (
            Duration::from_millis(policy.sample_window_ms),
            Duration::from_millis(policy.backpressure_window_ms),
        )
    }
}

pub(crate) async fn run_router(
    mut router: Router,
    mut notes_rx: mpsc::UnboundedReceiver<RawNotification>,
    cancel: CancellationToken,
) {
    let (sample_window, report_window) = router.windows();
    let mut next_sample = Instant::now() + sample_window;
    let mut next_report = Instant::now() + report_window;

    loop {
        select! {
            _ = cancel.cancelled() => break,
            maybe_note = notes_rx.recv() => match maybe_note {
                Some(note) => router.route(note),
                None => break,
            },
            _ = time::sleep_until(next_sample) => {
                router.flush_samples();
                let (sample_window, _) = router.windows();
                next_sample = Instant::now() + sample_window;
            }
            _ = time::sleep_until(next_report) => {
                let (_, report_window) = router.windows();
                router.report_backpressure(report_window.as_millis() as u64);
                next_report = Instant::now() + report_window;
            }
        }
    }
}
