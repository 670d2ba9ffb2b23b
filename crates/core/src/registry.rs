use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use jsonrpc_core::Error;
use leash_types::SubscriptionInfo;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::{
    error::{LeashError, LeashResult},
    subscriptions::SubscribeRequest,
};

/// A subscribe request on its way to the wire, as handed to the bundler and
/// replayed after reconnects.
#[derive(Clone, Debug)]
pub struct PendingSubscribe {
    pub key: String,
    pub method: &'static str,
    pub params: Value,
}

/// An unsubscribe for a wire id of the current epoch. Only meaningful while
/// the connection that assigned the id is still live; the supervisor
/// discards it otherwise.
#[derive(Debug)]
pub struct WireUnsubscribe {
    pub method: &'static str,
    pub wire_id: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AckState {
    Pending,
    Acked(u64),
    Rejected(Error),
}

struct Entry {
    request: SubscribeRequest,
    wire_id: Option<u64>,
    ref_count: usize,
    created_order: u64,
    ack_tx: watch::Sender<AckState>,
    ack_rx: watch::Receiver<AckState>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, Entry>,
    by_wire: HashMap<u64, String>,
}

/// Tracks logical subscriptions, their reference counts and the epoch-scoped
/// mapping to server-assigned wire ids.
///
/// All mutation goes through these methods; lock sections are short and
/// never cross an await point. `subscribe`/`release` are callable from any
/// thread and never touch the network, they only enqueue work.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    order: Arc<AtomicU64>,
    bundle_tx: mpsc::UnboundedSender<PendingSubscribe>,
    unsub_tx: mpsc::UnboundedSender<WireUnsubscribe>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(
        bundle_tx: mpsc::UnboundedSender<PendingSubscribe>,
        unsub_tx: mpsc::UnboundedSender<WireUnsubscribe>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            order: Arc::new(AtomicU64::new(0)),
            bundle_tx,
            unsub_tx,
        }
    }

    /// Register intent for `request`. The first caller for a key enqueues a
    /// wire subscribe; later callers share the existing subscription.
    pub fn subscribe(&self, request: SubscribeRequest) -> SubscriptionHandle {
        let mut inner = self.inner.write().unwrap();

        if let Some(entry) = inner.entries.get_mut(&request.key) {
            entry.ref_count += 1;
            return SubscriptionHandle {
                key: request.key,
                ack_rx: entry.ack_rx.clone(),
                registry: self.clone(),
            };
        }

        let (ack_tx, ack_rx) = watch::channel(AckState::Pending);
        let created_order = self.order.fetch_add(1, Ordering::SeqCst);
        let pending = PendingSubscribe {
            key: request.key.clone(),
            method: request.method,
            params: request.params.clone(),
        };
        let handle = SubscriptionHandle {
            key: request.key.clone(),
            ack_rx: ack_rx.clone(),
            registry: self.clone(),
        };
        inner.entries.insert(
            request.key.clone(),
            Entry {
                request,
                wire_id: None,
                ref_count: 1,
                created_order,
                ack_tx,
                ack_rx,
            },
        );
        drop(inner);

        let _ = self.bundle_tx.send(pending);
        handle
    }

    fn release(&self, key: &str) {
        let mut inner = self.inner.write().unwrap();
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }

        let entry = inner.entries.remove(key).unwrap();
        if let Some(wire_id) = entry.wire_id {
            inner.by_wire.remove(&wire_id);
            drop(inner);
            // Best-effort server-side cleanup; local bookkeeping is already
            // gone either way.
            let _ = self.unsub_tx.send(WireUnsubscribe {
                method: entry.request.unsubscribe_method,
                wire_id,
            });
        }
    }

    /// Fix the key ↔ wire id mapping for the current connection epoch.
    pub fn on_ack(&self, key: &str, wire_id: u64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.wire_id = Some(wire_id);
            let _ = entry.ack_tx.send(AckState::Acked(wire_id));
            inner.by_wire.insert(wire_id, key.to_string());
        }
    }

    /// Server declined the subscribe: resolve the waiting handles and drop
    /// the entry. A per-call failure, not a connection failure.
    pub fn on_reject(&self, key: &str, error: Error) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.entries.remove(key) {
            let _ = entry.ack_tx.send(AckState::Rejected(error));
        }
    }

    /// A new connection epoch begins: every wire id is now invalid, the
    /// logical set is untouched.
    pub fn on_disconnect(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.by_wire.clear();
        for entry in inner.entries.values_mut() {
            entry.wire_id = None;
            let _ = entry.ack_tx.send(AckState::Pending);
        }
    }

    /// All live subscriptions in creation order, for replay after reconnect.
    pub fn resubscribe_all(&self) -> Vec<PendingSubscribe> {
        let inner = self.inner.read().unwrap();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|entry| entry.created_order);
        entries
            .iter()
            .map(|entry| PendingSubscribe {
                key: entry.request.key.clone(),
                method: entry.request.method,
                params: entry.request.params.clone(),
            })
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().unwrap().entries.contains_key(key)
    }

    /// True while `key` is live but has no wire id for the current epoch,
    /// i.e. a subscribe still needs to reach the wire. Used by the
    /// supervisor to drop duplicate or obsolete batch entries.
    pub fn awaits_wire_id(&self, key: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .get(key)
            .map(|entry| entry.wire_id.is_none())
            .unwrap_or(false)
    }

    /// Map an inbound wire id back to its logical key. `None` means the id
    /// belongs to a stale epoch and the frame must be dropped.
    pub fn resolve(&self, wire_id: u64) -> Option<String> {
        self.inner.read().unwrap().by_wire.get(&wire_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let inner = self.inner.read().unwrap();
        let mut infos: Vec<SubscriptionInfo> = inner
            .entries
            .values()
            .map(|entry| SubscriptionInfo {
                key: entry.request.key.clone(),
                method: entry.request.method.to_string(),
                wire_id: entry.wire_id,
                ref_count: entry.ref_count,
                created_order: entry.created_order,
            })
            .collect();
        infos.sort_by_key(|info| info.created_order);
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller-held token for one `subscribe` call. `close` releases this
/// caller's share; the wire subscription goes away when the last share is
/// closed. Dropping a handle without closing it keeps the subscription
/// alive.
pub struct SubscriptionHandle {
    key: String,
    ack_rx: watch::Receiver<AckState>,
    registry: SubscriptionRegistry,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolves once the server acks the subscribe for the current epoch
    /// (with the assigned wire id) or rejects it. Reconnects reset the state
    /// to pending, so this can be awaited again after a drop.
    pub async fn acknowledged(&mut self) -> LeashResult<u64> {
        loop {
            let state = self.ack_rx.borrow_and_update().clone();
            match state {
                AckState::Acked(wire_id) => return Ok(wire_id),
                AckState::Rejected(error) => {
                    return Err(LeashError::subscription_rejected(&self.key, error));
                }
                AckState::Pending => {
                    self.ack_rx
                        .changed()
                        .await
                        .map_err(|_| LeashError::channel_closed("ack"))?;
                }
            }
        }
    }

    pub fn close(self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use solana_pubkey::Pubkey;

    use super::*;

    fn registry() -> (
        SubscriptionRegistry,
        mpsc::UnboundedReceiver<PendingSubscribe>,
        mpsc::UnboundedReceiver<WireUnsubscribe>,
    ) {
        let (bundle_tx, bundle_rx) = mpsc::unbounded_channel();
        let (unsub_tx, unsub_rx) = mpsc::unbounded_channel();
        (SubscriptionRegistry::new(bundle_tx, unsub_tx), bundle_rx, unsub_rx)
    }

    fn account_request(byte: u8) -> SubscribeRequest {
        SubscribeRequest::account(&Pubkey::new_from_array([byte; 32]), None)
    }

    #[tokio::test]
    async fn duplicate_subscribes_share_one_wire_request() {
        let (registry, mut bundle_rx, _unsub_rx) = registry();

        let first = registry.subscribe(account_request(1));
        let second = registry.subscribe(account_request(1));
        let third = registry.subscribe(account_request(1));

        assert_eq!(bundle_rx.recv().await.unwrap().key, first.key());
        assert!(bundle_rx.try_recv().is_err(), "dedup must not hit the wire");
        assert_eq!(registry.snapshot()[0].ref_count, 3);

        second.close();
        third.close();
        assert_eq!(registry.snapshot()[0].ref_count, 1);
        first.close();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn last_close_unsubscribes_only_when_acked() {
        let (registry, _bundle_rx, mut unsub_rx) = registry();

        let unacked = registry.subscribe(account_request(1));
        unacked.close();
        assert!(unsub_rx.try_recv().is_err(), "no wire id, nothing to unsubscribe");

        let acked = registry.subscribe(account_request(2));
        registry.on_ack(acked.key(), 77);
        acked.close();
        let unsub = unsub_rx.recv().await.unwrap();
        assert_eq!(unsub.wire_id, 77);
        assert_eq!(unsub.method, "accountUnsubscribe");
    }

    #[tokio::test]
    async fn acknowledged_resolves_on_ack_and_reject() {
        let (registry, _bundle_rx, _unsub_rx) = registry();

        let mut ok = registry.subscribe(account_request(1));
        registry.on_ack(ok.key(), 5);
        assert_eq!(ok.acknowledged().await.unwrap(), 5);

        let mut rejected = registry.subscribe(account_request(2));
        registry.on_reject(rejected.key(), Error::invalid_params("nope"));
        assert!(rejected.acknowledged().await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_invalidates_wire_ids_but_keeps_the_set() {
        let (registry, _bundle_rx, _unsub_rx) = registry();

        let a = registry.subscribe(account_request(1));
        let b = registry.subscribe(account_request(2));
        registry.on_ack(a.key(), 10);
        registry.on_ack(b.key(), 11);
        assert_eq!(registry.resolve(10).as_deref(), Some(a.key()));

        registry.on_disconnect();
        assert_eq!(registry.resolve(10), None);
        assert_eq!(registry.resolve(11), None);
        assert_eq!(registry.len(), 2);
        for info in registry.snapshot() {
            assert_eq!(info.wire_id, None);
        }
    }

    #[tokio::test]
    async fn replay_follows_creation_order() {
        let (registry, _bundle_rx, _unsub_rx) = registry();

        let keys: Vec<String> = (1..=5)
            .map(|byte| {
                registry
                    .subscribe(account_request(byte))
                    .key()
                    .to_string()
            })
            .collect();

        let replay: Vec<String> = registry
            .resubscribe_all()
            .into_iter()
            .map(|pending| pending.key)
            .collect();
        assert_eq!(replay, keys);
    }

    #[tokio::test]
    async fn stale_wire_ids_resolve_to_none() {
        let (registry, _bundle_rx, _unsub_rx) = registry();
        assert_eq!(registry.resolve(404), None);
    }
}
