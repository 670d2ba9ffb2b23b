use std::{future::Future, str::FromStr, time::Duration};

use leash_types::{ConnectionState, WsEvent};
use serde_json::Value;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use tokio::{select, sync::watch, time};
use tokio_util::sync::CancellationToken;

use crate::{registry::SubscriptionRegistry, router::EventSender};

/// Injected state source for the fallback poller: given a live subscription,
/// produce the current value (or nothing, for key classes that cannot be
/// polled over request/response RPC).
pub trait PollSource: Send + Sync + 'static {
    fn poll(&self, key: &str, params: &Value) -> impl Future<Output = Option<Value>> + Send;
}

#[derive(Debug, PartialEq, Eq)]
enum PollTarget {
    Account(Pubkey),
    Signature(Signature),
    Slot,
}

fn classify(key: &str) -> Option<PollTarget> {
    if let Some(rest) = key.strip_prefix("acct:") {
        let pubkey = rest.split('#').next().unwrap_or(rest);
        return Pubkey::from_str(pubkey).ok().map(PollTarget::Account);
    }
    if let Some(rest) = key.strip_prefix("sig:") {
        let signature = rest.split('#').next().unwrap_or(rest);
        return Signature::from_str(signature).ok().map(PollTarget::Signature);
    }
    if key == "slot" {
        return Some(PollTarget::Slot);
    }
    None
}

fn notification_method(subscribe_method: &str) -> String {
    subscribe_method
        .strip_suffix("Subscribe")
        .map(|prefix| format!("{prefix}Notification"))
        .unwrap_or_else(|| subscribe_method.to_string())
}

/// Poll source backed by a request/response RPC endpoint, so consumers keep
/// seeing state while the push connection is down.
pub struct RemotePollClient {
    pub client: RpcClient,
}

impl Clone for RemotePollClient {
    fn clone(&self) -> Self {
        let remote_rpc_url = self.client.url();
        RemotePollClient {
            client: RpcClient::new(remote_rpc_url),
        }
    }
}

impl RemotePollClient {
    pub fn new(remote_rpc_url: &str) -> Self {
        RemotePollClient {
            client: RpcClient::new(remote_rpc_url.to_string()),
        }
    }
}

impl PollSource for RemotePollClient {
    async fn poll(&self, key: &str, _params: &Value) -> Option<Value> {
        match classify(key)? {
            PollTarget::Account(pubkey) => {
                let response = self
                    .client
                    .get_account_with_commitment(&pubkey, CommitmentConfig::confirmed())
                    .await
                    .ok()?;
                serde_json::to_value(response.value).ok()
            }
            PollTarget::Signature(signature) => {
                let response = self
                    .client
                    .get_signature_statuses(&[signature])
                    .await
                    .ok()?;
                serde_json::to_value(response.value.first().cloned().flatten()).ok()
            }
            PollTarget::Slot => self.client.get_slot().await.ok().map(Value::from),
        }
    }
}

/// Runs only while the connection is down: walks the live subscription set
/// every `poll_interval` and synthesizes sampled notifications with the
/// polled state. Goes quiet the moment the supervisor reports `Connected`.
pub(crate) async fn run_poller<P: PollSource>(
    source: P,
    poll_interval: Duration,
    registry: SubscriptionRegistry,
    events: EventSender,
    mut state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) {
    loop {
        if matches!(*state_rx.borrow_and_update(), ConnectionState::Connected) {
            select! {
                _ = cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        select! {
            _ = cancel.cancelled() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = time::sleep(poll_interval) => {
                for pending in registry.resubscribe_all() {
                    if matches!(*state_rx.borrow(), ConnectionState::Connected) {
                        break;
                    }
                    if let Some(payload) = source.poll(&pending.key, &pending.params).await {
                        events.emit(WsEvent::notification(
                            pending.key,
                            0,
                            notification_method(pending.method),
                            payload,
                            true,
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::subscriptions::SubscribeRequest;

    struct StaticSource;

    impl PollSource for StaticSource {
        async fn poll(&self, key: &str, _params: &Value) -> Option<Value> {
            (key == "slot").then(|| json!(1234))
        }
    }

    #[test]
    fn classifies_pollable_keys() {
        let pubkey = Pubkey::new_from_array([1; 32]);
        assert_eq!(
            classify(&format!("acct:{pubkey}")),
            Some(PollTarget::Account(pubkey))
        );
        assert_eq!(
            classify(&format!("acct:{pubkey}#ab12cd34")),
            Some(PollTarget::Account(pubkey))
        );
        assert_eq!(classify("slot"), Some(PollTarget::Slot));
        assert_eq!(classify("logs:ab12cd34"), None);
        assert_eq!(classify("acct:not-a-pubkey"), None);
    }

    #[test]
    fn notification_method_mirrors_subscribe_method() {
        assert_eq!(notification_method("accountSubscribe"), "accountNotification");
        assert_eq!(notification_method("slotSubscribe"), "slotNotification");
    }

    #[tokio::test(start_paused = true)]
    async fn polls_while_disconnected_and_stops_on_reconnect() {
        let (bundle_tx, _bundle_rx) = mpsc::unbounded_channel();
        let (unsub_tx, _unsub_rx) = mpsc::unbounded_channel();
        let registry = SubscriptionRegistry::new(bundle_tx, unsub_tx);
        let _handle = registry.subscribe(SubscribeRequest::slot());

        let (events, events_rx) = EventSender::new(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Reconnecting(1));
        let cancel = CancellationToken::new();

        tokio::spawn(run_poller(
            StaticSource,
            Duration::from_millis(500),
            registry,
            events,
            state_rx,
            cancel.clone(),
        ));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        time::advance(Duration::from_millis(600)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        match events_rx.try_recv().unwrap() {
            WsEvent::Notification(note) => {
                assert_eq!(note.key, "slot");
                assert_eq!(note.wire_id, 0);
                assert!(note.sampled);
                assert_eq!(note.payload, json!(1234));
            }
            other => panic!("expected synthesized notification, got {other:?}"),
        }

        state_tx.send(ConnectionState::Connected).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        while events_rx.try_recv().is_ok() {}
        time::advance(Duration::from_millis(2_000)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(events_rx.try_recv().is_err(), "poller must stop when connected");
        cancel.cancel();
    }
}
