use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value as JsonValue;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use tacit_envelope::{Codec, EnvelopeError, EnvelopeType};
use tacit_store::{
    PendingRequestRecord, RequestHistory, RequestId, SubscriptionId, Topic, TransportType,
};

use crate::error::RelayError;
use crate::lifecycle::LifecycleManager;
use crate::rpc::{
    method, BatchSubscribeParams, PublishParams, RpcErrorBody, RpcErrorResponse, RpcPayload,
    RpcRequest, RpcResult, SubscribeParams, SubscriptionPush, UnsubscribeParams,
};
use crate::socket::ConnectivityProbe;
use crate::subscriptions::SubscriptionSet;

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Messages held per not-yet-acknowledged topic.
const QUEUE_LIMIT: usize = 64;

/// Outbound application request, already typed by the caller.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub id: RequestId,
    pub topic: Topic,
    pub method: String,
    pub params: JsonValue,
    pub tag: u32,
    /// Seconds.
    pub ttl: u64,
    pub envelope: EnvelopeType,
    pub transport_type: TransportType,
    pub correlation_id: Option<RequestId>,
}

/// Decrypted inbound peer request ("client sync" event).
#[derive(Clone, Debug, PartialEq)]
pub struct InboundRequest {
    pub id: RequestId,
    pub topic: Topic,
    pub method: String,
    pub params: JsonValue,
    pub sender_public_key: Option<String>,
}

/// Decrypted inbound peer response, correlated to a recorded request.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundResponse {
    pub id: RequestId,
    pub topic: Topic,
    pub method: String,
    pub outcome: Result<JsonValue, RpcErrorBody>,
}

/// Non-fatal inbound failures, published for observability instead of thrown.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum InternalError {
    Decrypt { topic: Topic, reason: String },
    Decode { topic: Topic },
    UnmatchedResponse { topic: Topic, id: RequestId },
    History { message: String },
}

/// The encrypted request/response layer above the transport.
pub struct RelayClient {
    name: String,
    lifecycle: Arc<LifecycleManager>,
    codec: Arc<dyn Codec>,
    history: Arc<dyn RequestHistory>,
    connectivity: Arc<dyn ConnectivityProbe>,
    subscriptions: Arc<SubscriptionSet>,
    /// Topics that should be subscribed. Survives the connection, unlike the
    /// acknowledged set, so a reconnect can restore them.
    tracked: Mutex<BTreeSet<Topic>>,
    /// Inbound envelopes for topics whose subscription is not acknowledged
    /// yet; drained once the ack lands, dropped on unsubscribe.
    queued: Mutex<BTreeMap<Topic, Vec<SubscriptionPush>>>,
    requests_tx: broadcast::Sender<InboundRequest>,
    responses_tx: broadcast::Sender<InboundResponse>,
    errors_tx: broadcast::Sender<InternalError>,
    cancel: CancellationToken,
}

impl RelayClient {
    pub fn new(
        name: impl Into<String>,
        lifecycle: Arc<LifecycleManager>,
        codec: Arc<dyn Codec>,
        history: Arc<dyn RequestHistory>,
        connectivity: Arc<dyn ConnectivityProbe>,
        subscriptions: Arc<SubscriptionSet>,
    ) -> Arc<Self> {
        let (requests_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (responses_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (errors_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let client = Arc::new(Self {
            name: name.into(),
            lifecycle: lifecycle.clone(),
            codec,
            history,
            connectivity,
            subscriptions,
            tracked: Mutex::new(BTreeSet::new()),
            queued: Mutex::new(BTreeMap::new()),
            requests_tx,
            responses_tx,
            errors_tx,
            cancel: CancellationToken::new(),
        });

        Self::spawn_push_drain(Arc::downgrade(&client), lifecycle.clone());
        Self::spawn_state_drain(Arc::downgrade(&client), lifecycle);
        client
    }

    /// Restore tracked subscriptions whenever the connection comes back: the
    /// relay forgot their ids with the old connection.
    fn spawn_state_drain(weak: Weak<Self>, lifecycle: Arc<LifecycleManager>) {
        let mut states = lifecycle.states();
        let cancel = match weak.upgrade() {
            Some(client) => client.cancel.clone(),
            None => return,
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    state = states.recv() => match state {
                        Ok(crate::lifecycle::ConnectionState::Open) => {
                            let Some(client) = weak.upgrade() else { break };
                            client.restore_subscriptions().await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("relay client: state stream lagged by {missed}");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn restore_subscriptions(&self) {
        let missing: Vec<Topic> = {
            let tracked = self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tracked
                .iter()
                .filter(|topic| !self.subscriptions.contains(topic))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return;
        }
        log::info!("relay({}): restoring {} subscriptions", self.name, missing.len());
        if let Err(err) = self.batch_subscribe(&missing).await {
            log::warn!("relay({}): restoring subscriptions failed: {err}", self.name);
        }
    }

    fn spawn_push_drain(weak: Weak<Self>, lifecycle: Arc<LifecycleManager>) {
        let mut pushes = lifecycle.pushes();
        let cancel = match weak.upgrade() {
            Some(client) => client.cancel.clone(),
            None => return,
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    push = pushes.recv() => match push {
                        Ok(push) => {
                            let Some(client) = weak.upgrade() else { break };
                            client.handle_push(push).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("relay client: push stream lagged by {missed}");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    // ── Event streams ─────────────────────────────────────────────────────────

    pub fn requests(&self) -> broadcast::Receiver<InboundRequest> {
        self.requests_tx.subscribe()
    }

    pub fn responses(&self) -> broadcast::Receiver<InboundResponse> {
        self.responses_tx.subscribe()
    }

    pub fn internal_errors(&self) -> broadcast::Receiver<InternalError> {
        self.errors_tx.subscribe()
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionSet> {
        &self.subscriptions
    }

    // ── Outbound path ─────────────────────────────────────────────────────────

    /// Encrypt and publish one application request.
    ///
    /// The history record is inserted first; an id already recorded means the
    /// identical request is still in flight and the send is skipped.
    pub async fn publish_request(&self, request: OutboundRequest) -> Result<(), RelayError> {
        if !self.connectivity.is_online() {
            return Err(RelayError::NoConnectivity);
        }

        let body = serde_json::to_string(&RpcRequest::new(
            request.id,
            request.method.clone(),
            request.params,
        ))
        .map_err(|err| RelayError::wire(err.to_string()))?;

        let inserted = self
            .history
            .set_request(PendingRequestRecord {
                id: request.id,
                topic: request.topic.clone(),
                method: request.method.clone(),
                body: body.clone(),
                transport_type: request.transport_type,
                response: None,
            })
            .await?;
        if !inserted {
            log::debug!(
                "relay({}): request {} already in flight, not re-sent",
                self.name,
                request.id
            );
            return Ok(());
        }

        let message = self.codec.encrypt(&request.topic, &body, &request.envelope).await?;
        self.publish(PublishParams {
            topic: request.topic,
            message,
            ttl: request.ttl,
            tag: request.tag,
            correlation_id: request.correlation_id,
        })
        .await
    }

    /// Encrypt and publish one response to a previously recorded request.
    pub async fn publish_response(
        &self,
        topic: &Topic,
        id: RequestId,
        outcome: Result<JsonValue, RpcErrorBody>,
        tag: u32,
        ttl: u64,
    ) -> Result<(), RelayError> {
        if !self.connectivity.is_online() {
            return Err(RelayError::NoConnectivity);
        }

        let body = match outcome {
            Ok(result) => serde_json::to_string(&RpcResult::new(id, result)),
            Err(error) => serde_json::to_string(&RpcErrorResponse::new(id, error)),
        }
        .map_err(|err| RelayError::wire(err.to_string()))?;

        let recorded = self.history.update_with_response(id, body.clone()).await?;
        if !recorded {
            log::debug!("relay({}): request {} already answered, not re-sent", self.name, id);
            return Ok(());
        }

        let message = self.codec.encrypt(topic, &body, &EnvelopeType::Type0).await?;
        self.publish(PublishParams {
            topic: topic.clone(),
            message,
            ttl,
            tag,
            correlation_id: Some(id),
        })
        .await
    }

    async fn publish(&self, params: PublishParams) -> Result<(), RelayError> {
        let params =
            serde_json::to_value(&params).map_err(|err| RelayError::wire(err.to_string()))?;
        let ack = self.lifecycle.call(method::PUBLISH, params).await?;
        match serde_json::from_value::<bool>(ack) {
            Ok(true) => Ok(()),
            _ => Err(RelayError::UnexpectedResult { method: method::PUBLISH.to_owned() }),
        }
    }

    // ── Subscription management ───────────────────────────────────────────────

    pub async fn subscribe(&self, topic: &Topic) -> Result<SubscriptionId, RelayError> {
        if !self.connectivity.is_online() {
            return Err(RelayError::NoConnectivity);
        }
        let params = serde_json::to_value(SubscribeParams { topic: topic.clone() })
            .map_err(|err| RelayError::wire(err.to_string()))?;
        let ack = self.lifecycle.call(method::SUBSCRIBE, params).await?;
        let id = serde_json::from_value::<SubscriptionId>(ack)
            .map_err(|_| RelayError::UnexpectedResult { method: method::SUBSCRIBE.to_owned() })?;
        self.subscriptions.insert(topic.clone(), id.clone());
        {
            let mut tracked =
                self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tracked.insert(topic.clone());
        }
        self.drain_queued(topic).await;
        Ok(id)
    }

    /// Batch subscription, chunked by the protocol limit.
    ///
    /// Chunk calls run concurrently; completion is observed in chunk order and
    /// the first failing chunk fails the whole call immediately. Chunks that
    /// acknowledged before the failure stay committed to the subscription set.
    pub async fn batch_subscribe(
        &self,
        topics: &[Topic],
    ) -> Result<Vec<SubscriptionId>, RelayError> {
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        if !self.connectivity.is_online() {
            return Err(RelayError::NoConnectivity);
        }

        let chunk_size = self.lifecycle.config().batch_chunk_size;
        let chunks: Vec<Vec<Topic>> =
            topics.chunks(chunk_size).map(|chunk| chunk.to_vec()).collect();

        let mut handles = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let lifecycle = self.lifecycle.clone();
            let subscriptions = self.subscriptions.clone();
            handles.push((
                chunk.clone(),
                tokio::spawn(async move {
                    let params =
                        serde_json::to_value(BatchSubscribeParams { topics: chunk.clone() })
                            .map_err(|err| RelayError::wire(err.to_string()))?;
                    let ack = lifecycle.call(method::BATCH_SUBSCRIBE, params).await?;
                    let ids =
                        serde_json::from_value::<Vec<SubscriptionId>>(ack).map_err(|_| {
                            RelayError::UnexpectedResult {
                                method: method::BATCH_SUBSCRIBE.to_owned(),
                            }
                        })?;
                    // Commit immediately on ack; an overall failure later
                    // does not roll these back.
                    for (topic, id) in chunk.iter().zip(ids.iter()) {
                        subscriptions.insert(topic.clone(), id.clone());
                    }
                    Ok::<Vec<SubscriptionId>, RelayError>(ids)
                }),
            ));
        }

        let mut all_ids = Vec::with_capacity(topics.len());
        let mut failure = None;
        for (index, (chunk, handle)) in handles.into_iter().enumerate() {
            if let Some(_err) = &failure {
                // First failure wins; later chunks are not awaited.
                handle.abort();
                continue;
            }
            match handle.await {
                Ok(Ok(ids)) => {
                    all_ids.extend(ids);
                    {
                        let mut tracked = self
                            .tracked
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        tracked.extend(chunk.iter().cloned());
                    }
                    for topic in &chunk {
                        self.drain_queued(topic).await;
                    }
                }
                Ok(Err(err)) => {
                    log::warn!(
                        "relay({}): batch subscribe chunk {index} failed: {err}",
                        self.name
                    );
                    failure = Some(err);
                }
                Err(join_err) => {
                    failure = Some(RelayError::transport(join_err.to_string()));
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(all_ids),
        }
    }

    /// Unsubscribe and forget the topic: history records first, queued
    /// inbound messages second, then the subscription mapping.
    pub async fn unsubscribe(&self, topic: &Topic) -> Result<(), RelayError> {
        let id = self
            .subscriptions
            .get(topic)
            .ok_or_else(|| RelayError::NotSubscribed { topic: topic.to_string() })?;

        let params = serde_json::to_value(UnsubscribeParams { topic: topic.clone(), id })
            .map_err(|err| RelayError::wire(err.to_string()))?;
        self.lifecycle.call(method::UNSUBSCRIBE, params).await?;

        self.history.delete_by_topic(topic).await?;
        {
            let mut queued =
                self.queued.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            queued.remove(topic);
        }
        {
            let mut tracked =
                self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tracked.remove(topic);
        }
        self.subscriptions.remove(topic);
        Ok(())
    }

    // ── Connection-establishment calls ────────────────────────────────────────

    pub async fn propose_session(&self, params: JsonValue) -> Result<JsonValue, RelayError> {
        if !self.connectivity.is_online() {
            return Err(RelayError::NoConnectivity);
        }
        self.lifecycle.call(method::PROPOSE_SESSION, params).await
    }

    pub async fn approve_session(&self, params: JsonValue) -> Result<JsonValue, RelayError> {
        if !self.connectivity.is_online() {
            return Err(RelayError::NoConnectivity);
        }
        self.lifecycle.call(method::APPROVE_SESSION, params).await
    }

    // ── Inbound path ──────────────────────────────────────────────────────────

    async fn handle_push(&self, push: SubscriptionPush) {
        let topic = push.data.topic.clone();
        if !self.subscriptions.contains(&topic) {
            // Subscription ack still in flight; hold the message.
            let mut queued =
                self.queued.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let pending = queued.entry(topic.clone()).or_default();
            if pending.len() < QUEUE_LIMIT {
                pending.push(push);
            } else {
                log::warn!("relay({}): queue full for topic {topic}, message dropped", self.name);
            }
            return;
        }
        self.process_push(push).await;
    }

    async fn drain_queued(&self, topic: &Topic) {
        let pending = {
            let mut queued =
                self.queued.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            queued.remove(topic).unwrap_or_default()
        };
        for push in pending {
            self.process_push(push).await;
        }
    }

    async fn process_push(&self, push: SubscriptionPush) {
        let topic = push.data.topic;
        let decoded = match self.codec.decrypt(&topic, &push.data.message).await {
            Ok(decoded) => decoded,
            Err(EnvelopeError::MissingKey { .. }) => {
                log::debug!("relay({}): no key for topic {topic}, message dropped", self.name);
                return;
            }
            Err(err) => {
                let _ = self
                    .errors_tx
                    .send(InternalError::Decrypt { topic, reason: err.to_string() });
                return;
            }
        };

        match RpcPayload::parse(&decoded.plaintext) {
            Some(RpcPayload::Request(request)) => {
                self.accept_request(topic, request, decoded.plaintext, decoded.sender_public_key)
                    .await;
            }
            Some(RpcPayload::Result(result)) => {
                self.correlate(topic, result.id, Ok(result.result), decoded.plaintext).await;
            }
            Some(RpcPayload::Error(error)) => {
                self.correlate(topic, error.id, Err(error.error), decoded.plaintext).await;
            }
            None => {
                let _ = self.errors_tx.send(InternalError::Decode { topic });
            }
        }
    }

    async fn accept_request(
        &self,
        topic: Topic,
        request: RpcRequest,
        plaintext: String,
        sender_public_key: Option<String>,
    ) {
        let record = PendingRequestRecord {
            id: request.id,
            topic: topic.clone(),
            method: request.method.clone(),
            body: plaintext,
            transport_type: TransportType::Relay,
            response: None,
        };
        match self.history.set_request(record).await {
            Ok(true) => {
                let _ = self.requests_tx.send(InboundRequest {
                    id: request.id,
                    topic,
                    method: request.method,
                    params: request.params,
                    sender_public_key,
                });
            }
            Ok(false) => {
                // Peer resend of a request we already hold.
                log::debug!("relay({}): duplicate request {} dropped", self.name, request.id);
            }
            Err(err) => {
                let _ = self.errors_tx.send(InternalError::History { message: err.to_string() });
            }
        }
    }

    async fn correlate(
        &self,
        topic: Topic,
        id: RequestId,
        outcome: Result<JsonValue, RpcErrorBody>,
        plaintext: String,
    ) {
        let record = match self.history.get(id).await {
            Ok(record) => record,
            Err(err) => {
                let _ = self.errors_tx.send(InternalError::History { message: err.to_string() });
                return;
            }
        };

        let Some(record) = record else {
            // No pending request. The approve-session result is the one
            // self-describing shape forwarded anyway; everything else is a
            // spoofable unsolicited result and is dropped.
            if let Ok(value) = &outcome {
                if is_approve_session_result(value) {
                    let _ = self.responses_tx.send(InboundResponse {
                        id,
                        topic,
                        method: method::APPROVE_SESSION.to_owned(),
                        outcome,
                    });
                    return;
                }
            }
            let _ = self.errors_tx.send(InternalError::UnmatchedResponse { topic, id });
            return;
        };

        match self.history.update_with_response(id, plaintext).await {
            Ok(true) => {
                let _ = self.responses_tx.send(InboundResponse {
                    id,
                    topic,
                    method: record.method,
                    outcome,
                });
            }
            Ok(false) => {
                log::debug!("relay({}): duplicate response for {} dropped", self.name, id);
            }
            Err(err) => {
                let _ = self.errors_tx.send(InternalError::History { message: err.to_string() });
            }
        }
    }
}

fn is_approve_session_result(value: &JsonValue) -> bool {
    value.get("responderPublicKey").is_some() && value.get("responseTopic").is_some()
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
