use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use jsonrpc_core::{Error, ErrorCode};
use leash_types::{ClientCommand, ConnectionState, LeashConfig, NotificationPolicy, WsEvent};
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    registry::{PendingSubscribe, SubscriptionRegistry, WireUnsubscribe},
    router::{EventSender, RawNotification},
    transport::{Transport, TransportFrame, TransportReceiver, TransportSender},
    wire::{self, InboundFrame, WireRequest},
};

enum PendingRequest {
    Subscribe(String),
    Unsubscribe,
}

enum Flow {
    Retry,
    Shutdown,
}

/// Owns the transport and drives the connection lifecycle: connect, replay
/// the registry, serve the epoch, reconnect with backoff, give up after too
/// many failures. All wire writes funnel through this task.
pub(crate) struct Supervisor<T: Transport> {
    pub config: LeashConfig,
    pub transport: T,
    pub registry: SubscriptionRegistry,
    pub events: EventSender,
    pub policy: Arc<RwLock<NotificationPolicy>>,
    pub state_tx: watch::Sender<ConnectionState>,
    /// Feeds the bundler; used to push the resubscribe replay through the
    /// same batching path as fresh subscribes.
    pub replay_tx: mpsc::UnboundedSender<PendingSubscribe>,
    pub batches_rx: mpsc::UnboundedReceiver<Vec<PendingSubscribe>>,
    pub unsub_rx: mpsc::UnboundedReceiver<WireUnsubscribe>,
    pub commands_rx: mpsc::UnboundedReceiver<ClientCommand>,
    pub notes_tx: mpsc::UnboundedSender<RawNotification>,
    pub cancel: CancellationToken,
}

impl<T: Transport> Supervisor<T> {
    pub(crate) async fn run(mut self) {
        let backoff = Backoff::new(self.config.min_backoff_ms, self.config.max_backoff_ms);
        let mut attempt: u32 = 0;
        let mut request_id: u64 = 0;

        'lifecycle: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            self.events
                .emit(WsEvent::info(format!("Connecting to {}", self.config.ws_url)));

            let connected = select! {
                _ = self.cancel.cancelled() => break 'lifecycle,
                result = self.transport.connect(&self.config.ws_url) => result,
            };
            let (mut sender, receiver) = match connected {
                Ok(halves) => halves,
                Err(e) => {
                    warn!("connection attempt failed: {e}");
                    self.events
                        .emit(WsEvent::warn(format!("Connection failed: {e}")));
                    attempt += 1;
                    match self.wait_before_retry(&backoff, &mut attempt).await {
                        Flow::Retry => continue 'lifecycle,
                        Flow::Shutdown => break 'lifecycle,
                    }
                }
            };

            attempt = 0;
            self.set_state(ConnectionState::Connected);
            self.events
                .emit(WsEvent::Connected(self.config.ws_url.clone()));

            let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
            let reader = tokio::spawn(read_frames(receiver, frames_tx));

            // Batches flushed while the socket was down are covered by the
            // replay below (their keys live in the registry), so they must
            // not also be sent verbatim.
            while self.batches_rx.try_recv().is_ok() {}

            // Replay the logical set through the bundler before anything
            // else reaches the wire. The epoch is ready, and notification
            // delivery resumes, only once every replayed key is acked or
            // rejected.
            let replay = self.registry.resubscribe_all();
            let mut awaiting_replay: HashSet<String> =
                replay.iter().map(|pending| pending.key.clone()).collect();
            let mut ready = awaiting_replay.is_empty();
            if ready {
                self.events.emit(WsEvent::Ready);
            } else {
                debug!("replaying {} subscription(s)", awaiting_replay.len());
            }
            for pending in replay {
                let _ = self.replay_tx.send(pending);
            }

            let mut pending_requests: HashMap<u64, PendingRequest> = HashMap::new();
            let mut held_notes: Vec<RawNotification> = Vec::new();
            let ping_interval = Duration::from_millis(self.config.ping_interval_ms);
            let mut heartbeat = time::interval_at(Instant::now() + ping_interval, ping_interval);
            let mut last_inbound = Instant::now();

            let reason: Option<String> = 'epoch: loop {
                select! {
                    _ = self.cancel.cancelled() => {
                        sender.close().await;
                        break 'epoch None;
                    }
                    maybe_frame = frames_rx.recv() => {
                        last_inbound = Instant::now();
                        match maybe_frame {
                            None => break 'epoch Some("connection closed by peer".to_string()),
                            Some(Err(e)) => break 'epoch Some(format!("transport error: {e}")),
                            Some(Ok(TransportFrame::Text(text))) => match wire::parse_frame(&text) {
                                Ok(InboundFrame::Response { id, result }) => {
                                    self.on_response(id, result, &mut pending_requests, &mut awaiting_replay);
                                    if !ready && awaiting_replay.is_empty() {
                                        ready = true;
                                        self.events.emit(WsEvent::Ready);
                                        for note in held_notes.drain(..) {
                                            let _ = self.notes_tx.send(note);
                                        }
                                    }
                                }
                                Ok(InboundFrame::Notification { method, subscription, payload }) => {
                                    let note = RawNotification { method, subscription, payload };
                                    if ready {
                                        let _ = self.notes_tx.send(note);
                                    } else {
                                        let cap = self.policy.read().unwrap().max_pending_notifications;
                                        if held_notes.len() < cap {
                                            held_notes.push(note);
                                        } else {
                                            self.events.count_drop();
                                        }
                                    }
                                }
                                Err(e) => {
                                    // Unreadable frame: drop it, stay connected.
                                    warn!("dropping unreadable frame: {e}");
                                }
                            },
                            Some(Ok(TransportFrame::Ping(payload))) => {
                                if let Err(e) = sender.send_pong(payload).await {
                                    break 'epoch Some(format!("pong failed: {e}"));
                                }
                            }
                            Some(Ok(TransportFrame::Pong)) => {}
                            Some(Ok(TransportFrame::Close)) => {
                                break 'epoch Some("close frame received".to_string());
                            }
                        }
                    }
                    Some(batch) = self.batches_rx.recv() => {
                        for pending in batch {
                            if !self.registry.contains(&pending.key) {
                                // Closed (or rejected) before its bundle
                                // flushed; nothing to replay either.
                                awaiting_replay.remove(&pending.key);
                                continue;
                            }
                            // A key reaches the wire at most once per epoch,
                            // no matter how many paths enqueued it.
                            if !self.registry.awaits_wire_id(&pending.key)
                                || subscribe_in_flight(&pending_requests, &pending.key)
                            {
                                continue;
                            }
                            request_id += 1;
                            pending_requests.insert(request_id, PendingRequest::Subscribe(pending.key));
                            let request = WireRequest::new(request_id, pending.method, pending.params);
                            if let Err(e) = sender.send_text(request.to_text()).await {
                                break 'epoch Some(format!("subscribe send failed: {e}"));
                            }
                        }
                        if !ready && awaiting_replay.is_empty() {
                            ready = true;
                            self.events.emit(WsEvent::Ready);
                            for note in held_notes.drain(..) {
                                let _ = self.notes_tx.send(note);
                            }
                        }
                    }
                    Some(unsub) = self.unsub_rx.recv() => {
                        request_id += 1;
                        pending_requests.insert(request_id, PendingRequest::Unsubscribe);
                        let request = WireRequest::unsubscribe(request_id, unsub.method, unsub.wire_id);
                        if let Err(e) = sender.send_text(request.to_text()).await {
                            break 'epoch Some(format!("unsubscribe send failed: {e}"));
                        }
                    }
                    Some(command) = self.commands_rx.recv() => match command {
                        ClientCommand::Close => {
                            sender.close().await;
                            break 'epoch None;
                        }
                        ClientCommand::Reconnect => {
                            sender.close().await;
                            break 'epoch Some("reconnect requested".to_string());
                        }
                        ClientCommand::UpdatePolicy(policy) => {
                            *self.policy.write().unwrap() = policy;
                        }
                    },
                    _ = heartbeat.tick() => {
                        if last_inbound.elapsed() >= ping_interval * 2 {
                            break 'epoch Some("heartbeat timeout".to_string());
                        }
                        if let Err(e) = sender.send_ping().await {
                            break 'epoch Some(format!("ping failed: {e}"));
                        }
                    }
                }
            };

            reader.abort();
            self.registry.on_disconnect();
            // Unsubscribes queued against the dead epoch carry invalid wire
            // ids; the server forgot them when the socket dropped.
            while self.unsub_rx.try_recv().is_ok() {}

            let Some(reason) = reason else {
                break 'lifecycle;
            };

            warn!("connection lost: {reason}");
            attempt += 1;
            self.events.emit(WsEvent::Disconnected(reason));
            match self.wait_before_retry(&backoff, &mut attempt).await {
                Flow::Retry => continue 'lifecycle,
                Flow::Shutdown => break 'lifecycle,
            }
        }

        self.cancel.cancel();
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(WsEvent::Shutdown);
    }

    fn on_response(
        &self,
        id: u64,
        result: Result<serde_json::Value, Error>,
        pending_requests: &mut HashMap<u64, PendingRequest>,
        awaiting_replay: &mut HashSet<String>,
    ) {
        match pending_requests.remove(&id) {
            Some(PendingRequest::Subscribe(key)) => {
                awaiting_replay.remove(&key);
                match result {
                    Ok(value) => match value.as_u64() {
                        Some(wire_id) => {
                            debug!("subscription {key} acked with wire id {wire_id}");
                            self.registry.on_ack(&key, wire_id);
                        }
                        None => {
                            let error = Error {
                                code: ErrorCode::ParseError,
                                message: "subscribe ack without an integer id".to_string(),
                                data: Some(value),
                            };
                            self.reject(key, error);
                        }
                    },
                    Err(error) => self.reject(key, error),
                }
            }
            Some(PendingRequest::Unsubscribe) => {
                debug!("unsubscribe request {id} confirmed: {}", result.is_ok());
            }
            None => {
                warn!("response for unknown request id {id}");
            }
        }
    }

    fn reject(&self, key: String, error: Error) {
        self.events.emit(WsEvent::SubscriptionRejected {
            key: key.clone(),
            message: error.message.clone(),
        });
        self.registry.on_reject(&key, error);
    }

    async fn wait_before_retry(&mut self, backoff: &Backoff, attempt: &mut u32) -> Flow {
        if *attempt > self.config.max_reconnect_attempts {
            warn!("giving up after {} reconnect attempts", *attempt - 1);
            self.set_state(ConnectionState::GaveUp);
            self.events.emit(WsEvent::GaveUp);
            loop {
                select! {
                    _ = self.cancel.cancelled() => return Flow::Shutdown,
                    maybe_command = self.commands_rx.recv() => match maybe_command {
                        None | Some(ClientCommand::Close) => return Flow::Shutdown,
                        Some(ClientCommand::Reconnect) => {
                            *attempt = 0;
                            return Flow::Retry;
                        }
                        Some(ClientCommand::UpdatePolicy(policy)) => {
                            *self.policy.write().unwrap() = policy;
                        }
                    },
                }
            }
        }

        self.set_state(ConnectionState::Reconnecting(*attempt));
        self.events.emit(WsEvent::Reconnecting(*attempt));
        let deadline = Instant::now() + backoff.next_delay(attempt.saturating_sub(1));
        loop {
            select! {
                _ = self.cancel.cancelled() => return Flow::Shutdown,
                _ = time::sleep_until(deadline) => return Flow::Retry,
                maybe_command = self.commands_rx.recv() => match maybe_command {
                    None | Some(ClientCommand::Close) => return Flow::Shutdown,
                    Some(ClientCommand::Reconnect) => {
                        *attempt = 0;
                        return Flow::Retry;
                    }
                    Some(ClientCommand::UpdatePolicy(policy)) => {
                        *self.policy.write().unwrap() = policy;
                    }
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("connection state: {state}");
        let _ = self.state_tx.send(state);
    }
}

fn subscribe_in_flight(pending_requests: &HashMap<u64, PendingRequest>, key: &str) -> bool {
    pending_requests
        .values()
        .any(|pending| matches!(pending, PendingRequest::Subscribe(k) if k == key))
}

/// Per-epoch reader task: forwards frames into the supervisor's select loop
/// and exits when the stream ends or errors.
async fn read_frames<R: TransportReceiver>(
    mut receiver: R,
    frames_tx: mpsc::UnboundedSender<crate::error::LeashResult<TransportFrame>>,
) {
    while let Some(result) = receiver.recv().await {
        let failed = result.is_err();
        if frames_tx.send(result).is_err() || failed {
            break;
        }
    }
}
