use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use tacit_relay::rpc::{
    method, BatchSubscribeParams, PublishParams, RpcErrorBody, RpcErrorResponse, RpcRequest,
    RpcResult, SubscribeParams, SubscriptionData, SubscriptionPush, UnsubscribeParams,
};
use tacit_relay::{RelayError, RelaySocket, SocketEvent};
use tacit_store::{SubscriptionId, Topic};

const RETAINED_LIMIT: usize = 64;

/// The server half of the relay protocol, in process.
///
/// Publishes are fanned out to every other subscribed socket and retained per
/// topic, so a late subscriber (or a reconnecting one) receives the backlog
/// on its subscription acknowledgement.
pub struct MockRelay {
    next_socket: AtomicU64,
    next_subscription: AtomicU64,
    next_push: AtomicU64,
    sockets: Mutex<BTreeMap<u64, broadcast::Sender<SocketEvent>>>,
    connected: Mutex<BTreeSet<u64>>,
    subscriptions: Mutex<BTreeMap<Topic, BTreeMap<u64, SubscriptionId>>>,
    retained: Mutex<BTreeMap<Topic, Vec<String>>>,
    publish_calls: AtomicU64,
    batch_calls: Mutex<Vec<usize>>,
    fail_batch_calls: Mutex<BTreeSet<usize>>,
    reject_connects: AtomicU64,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_socket: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            next_push: AtomicU64::new(1),
            sockets: Mutex::new(BTreeMap::new()),
            connected: Mutex::new(BTreeSet::new()),
            subscriptions: Mutex::new(BTreeMap::new()),
            retained: Mutex::new(BTreeMap::new()),
            publish_calls: AtomicU64::new(0),
            batch_calls: Mutex::new(Vec::new()),
            fail_batch_calls: Mutex::new(BTreeSet::new()),
            reject_connects: AtomicU64::new(0),
        })
    }

    /// New client endpoint on this relay.
    pub fn socket(self: &Arc<Self>) -> Arc<MockSocket> {
        let id = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let (events_tx, _) = broadcast::channel(256);
        self.lock_sockets().insert(id, events_tx.clone());
        Arc::new(MockSocket { id, relay: self.clone(), events_tx })
    }

    // ── Test scripting ────────────────────────────────────────────────────────

    /// Refuse the next `count` connect attempts (each refusal emits a
    /// `Closed` observation).
    pub fn reject_next_connects(&self, count: u64) {
        self.reject_connects.store(count, Ordering::Relaxed);
    }

    /// Fail the `index`-th (1-based) `irn_batchSubscribe` call with a relay
    /// error instead of acknowledging it.
    pub fn fail_batch_call(&self, index: usize) {
        self.lock_fail_batch().insert(index);
    }

    /// Drop every connection, as a relay-side outage would.
    pub fn disconnect_all(&self, reason: &str) {
        let connected: Vec<u64> = {
            let mut connected = self.lock_connected();
            let ids = connected.iter().copied().collect();
            connected.clear();
            ids
        };
        self.lock_subscriptions().clear();
        let sockets = self.lock_sockets();
        for id in connected {
            if let Some(events) = sockets.get(&id) {
                let _ = events.send(SocketEvent::Closed { reason: reason.to_owned() });
            }
        }
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_calls.load(Ordering::Relaxed)
    }

    /// Chunk sizes of every `irn_batchSubscribe` call, in arrival order.
    pub fn batch_call_sizes(&self) -> Vec<usize> {
        self.lock_batch_calls().clone()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.lock_subscriptions().get(topic).map(BTreeMap::len).unwrap_or(0)
    }

    // ── Server dispatch ───────────────────────────────────────────────────────

    fn handle_frame(&self, socket_id: u64, frame: &str) {
        let Ok(request) = serde_json::from_str::<RpcRequest>(frame) else {
            // Push acknowledgements and other client results are not tracked.
            return;
        };
        match request.method.as_str() {
            method::PUBLISH => self.handle_publish(socket_id, request),
            method::SUBSCRIBE => self.handle_subscribe(socket_id, request),
            method::BATCH_SUBSCRIBE => self.handle_batch_subscribe(socket_id, request),
            method::UNSUBSCRIBE => self.handle_unsubscribe(socket_id, request),
            method::PROPOSE_SESSION | method::APPROVE_SESSION => {
                self.reply_result(socket_id, request.id, serde_json::Value::Bool(true));
            }
            other => {
                self.reply_error(socket_id, request.id, -32601, &format!("unknown method {other}"));
            }
        }
    }

    fn handle_publish(&self, socket_id: u64, request: RpcRequest) {
        self.publish_calls.fetch_add(1, Ordering::Relaxed);
        let Ok(params) = serde_json::from_value::<PublishParams>(request.params) else {
            self.reply_error(socket_id, request.id, -32602, "malformed publish params");
            return;
        };

        {
            let mut retained = self.lock_retained();
            let backlog = retained.entry(params.topic.clone()).or_default();
            if backlog.len() < RETAINED_LIMIT {
                backlog.push(params.message.clone());
            }
        }

        let targets: Vec<(u64, SubscriptionId)> = {
            let subscriptions = self.lock_subscriptions();
            let connected = self.lock_connected();
            subscriptions
                .get(&params.topic)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .filter(|(id, _)| **id != socket_id && connected.contains(id))
                        .map(|(id, sub)| (*id, sub.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (target, subscription) in targets {
            self.deliver(target, &subscription, &params.topic, &params.message);
        }

        self.reply_result(socket_id, request.id, serde_json::Value::Bool(true));
    }

    fn handle_subscribe(&self, socket_id: u64, request: RpcRequest) {
        let Ok(params) = serde_json::from_value::<SubscribeParams>(request.params) else {
            self.reply_error(socket_id, request.id, -32602, "malformed subscribe params");
            return;
        };
        let subscription = self.record_subscription(socket_id, &params.topic);
        self.reply_result(socket_id, request.id, serde_json::Value::String(subscription.clone()));
        self.deliver_retained(socket_id, &subscription, &params.topic);
    }

    fn handle_batch_subscribe(&self, socket_id: u64, request: RpcRequest) {
        let Ok(params) = serde_json::from_value::<BatchSubscribeParams>(request.params) else {
            self.reply_error(socket_id, request.id, -32602, "malformed batch params");
            return;
        };

        let index = {
            let mut calls = self.lock_batch_calls();
            calls.push(params.topics.len());
            calls.len()
        };
        if self.lock_fail_batch().contains(&index) {
            self.reply_error(socket_id, request.id, -32000, "batch subscribe refused");
            return;
        }

        let mut ids = Vec::with_capacity(params.topics.len());
        for topic in &params.topics {
            ids.push(self.record_subscription(socket_id, topic));
        }
        self.reply_result(
            socket_id,
            request.id,
            serde_json::Value::Array(ids.iter().cloned().map(serde_json::Value::String).collect()),
        );
        for (topic, subscription) in params.topics.iter().zip(ids.iter()) {
            self.deliver_retained(socket_id, subscription, topic);
        }
    }

    fn handle_unsubscribe(&self, socket_id: u64, request: RpcRequest) {
        let Ok(params) = serde_json::from_value::<UnsubscribeParams>(request.params) else {
            self.reply_error(socket_id, request.id, -32602, "malformed unsubscribe params");
            return;
        };
        let mut subscriptions = self.lock_subscriptions();
        if let Some(subscribers) = subscriptions.get_mut(&params.topic) {
            subscribers.remove(&socket_id);
            if subscribers.is_empty() {
                subscriptions.remove(&params.topic);
            }
        }
        drop(subscriptions);
        self.reply_result(socket_id, request.id, serde_json::Value::Bool(true));
    }

    fn record_subscription(&self, socket_id: u64, topic: &Topic) -> SubscriptionId {
        let subscription = format!("mock-sub-{}", self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock_subscriptions()
            .entry(topic.clone())
            .or_default()
            .insert(socket_id, subscription.clone());
        subscription
    }

    fn deliver_retained(&self, socket_id: u64, subscription: &SubscriptionId, topic: &Topic) {
        let backlog = self.lock_retained().get(topic).cloned().unwrap_or_default();
        for message in backlog {
            self.deliver(socket_id, subscription, topic, &message);
        }
    }

    fn deliver(&self, socket_id: u64, subscription: &SubscriptionId, topic: &Topic, message: &str) {
        let push = SubscriptionPush {
            id: subscription.clone(),
            data: SubscriptionData {
                topic: topic.clone(),
                message: message.to_owned(),
                published_at: Some(0),
                tag: None,
            },
        };
        let Ok(params) = serde_json::to_value(&push) else { return };
        let frame = RpcRequest::new(
            self.next_push.fetch_add(1, Ordering::Relaxed),
            method::SUBSCRIPTION,
            params,
        );
        let Ok(frame) = serde_json::to_string(&frame) else { return };
        if let Some(events) = self.lock_sockets().get(&socket_id) {
            let _ = events.send(SocketEvent::Message(frame));
        }
    }

    fn reply_result(&self, socket_id: u64, id: u64, result: serde_json::Value) {
        let Ok(frame) = serde_json::to_string(&RpcResult::new(id, result)) else { return };
        if let Some(events) = self.lock_sockets().get(&socket_id) {
            let _ = events.send(SocketEvent::Message(frame));
        }
    }

    fn reply_error(&self, socket_id: u64, id: u64, code: i64, message: &str) {
        let error = RpcErrorBody { code, message: message.to_owned() };
        let Ok(frame) = serde_json::to_string(&RpcErrorResponse::new(id, error)) else { return };
        if let Some(events) = self.lock_sockets().get(&socket_id) {
            let _ = events.send(SocketEvent::Message(frame));
        }
    }

    // ── Lock helpers ──────────────────────────────────────────────────────────

    fn lock_sockets(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, broadcast::Sender<SocketEvent>>> {
        self.sockets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_connected(&self) -> std::sync::MutexGuard<'_, BTreeSet<u64>> {
        self.connected.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscriptions(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<Topic, BTreeMap<u64, SubscriptionId>>> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_retained(&self) -> std::sync::MutexGuard<'_, BTreeMap<Topic, Vec<String>>> {
        self.retained.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_batch_calls(&self) -> std::sync::MutexGuard<'_, Vec<usize>> {
        self.batch_calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_fail_batch(&self) -> std::sync::MutexGuard<'_, BTreeSet<usize>> {
        self.fail_batch_calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One client endpoint of a [`MockRelay`].
pub struct MockSocket {
    id: u64,
    relay: Arc<MockRelay>,
    events_tx: broadcast::Sender<SocketEvent>,
}

impl MockSocket {
    /// Close this endpoint from the relay side, invalidating its
    /// subscriptions, as a dropped connection would.
    pub fn force_close(&self, reason: &str) {
        self.relay.lock_connected().remove(&self.id);
        let mut subscriptions = self.relay.lock_subscriptions();
        subscriptions.retain(|_, subscribers| {
            subscribers.remove(&self.id);
            !subscribers.is_empty()
        });
        drop(subscriptions);
        let _ = self.events_tx.send(SocketEvent::Closed { reason: reason.to_owned() });
    }
}

#[async_trait]
impl RelaySocket for MockSocket {
    async fn connect(&self) -> Result<(), RelayError> {
        let remaining = self.relay.reject_connects.load(Ordering::Relaxed);
        if remaining > 0 {
            self.relay.reject_connects.store(remaining - 1, Ordering::Relaxed);
            let _ = self
                .events_tx
                .send(SocketEvent::Closed { reason: "connection refused".to_owned() });
            return Ok(());
        }
        self.relay.lock_connected().insert(self.id);
        let _ = self.events_tx.send(SocketEvent::Opened);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        self.force_close("client disconnect");
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), RelayError> {
        if !self.relay.lock_connected().contains(&self.id) {
            return Err(RelayError::transport("socket is not connected"));
        }
        self.relay.handle_frame(self.id, &frame);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.events_tx.subscribe()
    }
}
