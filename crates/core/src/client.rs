use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use leash_types::{
    ClientCommand, ConnectionState, LeashConfig, NotificationPolicy, SubscriptionInfo, WsEvent,
    channel,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    bundler,
    poller::{self, PollSource, RemotePollClient},
    registry::{SubscriptionHandle, SubscriptionRegistry},
    router::{EventSender, Router},
    runloops::Supervisor,
    subscriptions::SubscribeRequest,
    transport::Transport,
};

/// Handle to a running subscription engine. Cheap to clone; all methods are
/// safe to call from any thread and never block on the network.
///
/// `start` must be called from within a tokio runtime: the engine's
/// runloops are spawned onto it, while events flow out through a plain
/// crossbeam channel that any thread can drain.
#[derive(Clone)]
pub struct LeashClient {
    registry: SubscriptionRegistry,
    commands_tx: mpsc::UnboundedSender<ClientCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    policy: Arc<RwLock<NotificationPolicy>>,
    cancel: CancellationToken,
}

impl LeashClient {
    /// Start the engine against `transport` and begin connecting
    /// immediately. Returns the client handle and the outward event stream.
    pub fn start<T>(config: LeashConfig, transport: T) -> (Self, channel::Receiver<WsEvent>)
    where
        T: Transport,
    {
        Self::build(config, transport, None::<RemotePollClient>)
    }

    /// Like [`LeashClient::start`], with a fallback poller that keeps
    /// synthesizing sampled notifications from `poll_source` whenever the
    /// push connection is down.
    pub fn start_with_poller<T, P>(
        config: LeashConfig,
        transport: T,
        poll_source: P,
    ) -> (Self, channel::Receiver<WsEvent>)
    where
        T: Transport,
        P: PollSource,
    {
        Self::build(config, transport, Some(poll_source))
    }

    fn build<T, P>(
        config: LeashConfig,
        transport: T,
        poll_source: Option<P>,
    ) -> (Self, channel::Receiver<WsEvent>)
    where
        T: Transport,
        P: PollSource,
    {
        let (bundle_tx, bundle_rx) = mpsc::unbounded_channel();
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let (unsub_tx, unsub_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = EventSender::new(config.event_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let policy = Arc::new(RwLock::new(config.policy.clone()));
        let cancel = CancellationToken::new();
        let registry = SubscriptionRegistry::new(bundle_tx.clone(), unsub_tx);

        tokio::spawn(bundler::run_bundler(
            Duration::from_millis(config.bundle_window_ms),
            config.bundle_max_batch,
            bundle_rx,
            batches_tx,
            cancel.clone(),
        ));

        tokio::spawn(crate::router::run_router(
            Router::new(registry.clone(), events.clone(), policy.clone()),
            notes_rx,
            cancel.clone(),
        ));

        if let Some(source) = poll_source {
            tokio::spawn(poller::run_poller(
                source,
                Duration::from_millis(config.poll_interval_ms),
                registry.clone(),
                events.clone(),
                state_rx.clone(),
                cancel.clone(),
            ));
        }

        let supervisor = Supervisor {
            config,
            transport,
            registry: registry.clone(),
            events,
            policy: policy.clone(),
            state_tx,
            replay_tx: bundle_tx,
            batches_rx,
            unsub_rx,
            commands_rx,
            notes_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(supervisor.run());

        (
            Self {
                registry,
                commands_tx,
                state_rx,
                policy,
                cancel,
            },
            events_rx,
        )
    }

    /// Register intent to receive notifications for `request`. Repeated
    /// subscribes for the same key share one wire subscription; the first
    /// one costs one (bundled) wire round trip. Never blocks.
    pub fn subscribe(&self, request: SubscribeRequest) -> SubscriptionHandle {
        self.registry.subscribe(request)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.registry.snapshot()
    }

    pub fn policy(&self) -> NotificationPolicy {
        self.policy.read().unwrap().clone()
    }

    /// Swap the notification policy at runtime.
    pub fn update_policy(&self, policy: NotificationPolicy) {
        let _ = self.commands_tx.send(ClientCommand::UpdatePolicy(policy));
    }

    /// Leave `GaveUp` (or force a fresh connection), resetting the backoff
    /// attempt counter.
    pub fn reconnect(&self) {
        let _ = self.commands_tx.send(ClientCommand::Reconnect);
    }

    /// Terminal, idempotent shutdown: cancels every runloop, closes the
    /// socket and ends the event stream with `Shutdown`.
    pub fn close(&self) {
        if self.commands_tx.send(ClientCommand::Close).is_err() {
            self.cancel.cancel();
        }
    }
}
