use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tacit_store::RequestId;

use crate::config::ClientConfig;
use crate::error::RelayError;
use crate::rpc::{
    method, RpcErrorBody, RpcErrorResponse, RpcPayload, RpcRequest, RpcResult, SubscriptionPush,
};
use crate::socket::{RelaySocket, SocketEvent};
use crate::subscriptions::SubscriptionSet;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection state of the one owned relay socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Open,
    Closed { reason: String },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        *self == Self::Open
    }
}

/// One correlated call result observed on the socket.
#[derive(Clone, Debug, PartialEq)]
pub struct CallOutcome {
    pub id: RequestId,
    pub outcome: Result<JsonValue, RpcErrorBody>,
}

/// Owns the duplex connection: serialized connect attempts with a bounded
/// reconnect budget, and the multicast result/push streams every relay call
/// waits on.
pub struct LifecycleManager {
    name: String,
    socket: Arc<dyn RelaySocket>,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    /// Held by the one task driving a connect attempt.
    connect_gate: tokio::sync::Mutex<()>,
    state_tx: broadcast::Sender<ConnectionState>,
    results_tx: broadcast::Sender<CallOutcome>,
    push_tx: broadcast::Sender<SubscriptionPush>,
    /// Cleared on every observed close, forcing re-subscription.
    acked: Arc<SubscriptionSet>,
    cancel: CancellationToken,
}

impl LifecycleManager {
    pub fn new(
        name: impl Into<String>,
        socket: Arc<dyn RelaySocket>,
        acked: Arc<SubscriptionSet>,
        config: ClientConfig,
    ) -> Self {
        let name = name.into();
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (results_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (push_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(ConnectionState::Idle));
        let cancel = CancellationToken::new();

        let manager = Self {
            name: name.clone(),
            socket: socket.clone(),
            config,
            state: state.clone(),
            connect_gate: tokio::sync::Mutex::new(()),
            state_tx: state_tx.clone(),
            results_tx: results_tx.clone(),
            push_tx: push_tx.clone(),
            acked: acked.clone(),
            cancel: cancel.clone(),
        };

        let mut events = socket.events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            Self::handle_socket_event(
                                &name, &socket, &state, &state_tx, &results_tx, &push_tx,
                                &acked, event,
                            )
                            .await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("relay({name}): socket stream lagged by {missed}");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        manager
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_socket_event(
        name: &str,
        socket: &Arc<dyn RelaySocket>,
        state: &Arc<RwLock<ConnectionState>>,
        state_tx: &broadcast::Sender<ConnectionState>,
        results_tx: &broadcast::Sender<CallOutcome>,
        push_tx: &broadcast::Sender<SubscriptionPush>,
        acked: &Arc<SubscriptionSet>,
        event: SocketEvent,
    ) {
        match event {
            SocketEvent::Opened => {
                log::debug!("relay({name}): socket open");
                Self::set_state(state, state_tx, ConnectionState::Open);
            }
            SocketEvent::Closed { reason } => {
                log::debug!("relay({name}): socket closed: {reason}");
                // Subscription ids do not survive the connection.
                acked.clear();
                Self::set_state(state, state_tx, ConnectionState::Closed { reason });
            }
            SocketEvent::Message(frame) => {
                Self::demultiplex(name, socket, results_tx, push_tx, &frame).await;
            }
        }
    }

    async fn demultiplex(
        name: &str,
        socket: &Arc<dyn RelaySocket>,
        results_tx: &broadcast::Sender<CallOutcome>,
        push_tx: &broadcast::Sender<SubscriptionPush>,
        frame: &str,
    ) {
        match RpcPayload::parse(frame) {
            Some(RpcPayload::Request(request)) if request.method == method::SUBSCRIPTION => {
                match serde_json::from_value::<SubscriptionPush>(request.params) {
                    Ok(push) => {
                        // Best-effort push acknowledgement; the relay retries
                        // unacked pushes on its own schedule.
                        if let Ok(ack) =
                            serde_json::to_string(&RpcResult::new(request.id, JsonValue::Bool(true)))
                        {
                            let _ = socket.send(ack).await;
                        }
                        let _ = push_tx.send(push);
                    }
                    Err(err) => {
                        log::debug!("relay({name}): malformed subscription push: {err}");
                    }
                }
            }
            Some(RpcPayload::Request(request)) => {
                log::debug!("relay({name}): unexpected server request {}", request.method);
            }
            Some(RpcPayload::Result(result)) => {
                let _ = results_tx
                    .send(CallOutcome { id: result.id, outcome: Ok(result.result) });
            }
            Some(RpcPayload::Error(RpcErrorResponse { id, error, .. })) => {
                let _ = results_tx.send(CallOutcome { id, outcome: Err(error) });
            }
            None => {
                log::debug!("relay({name}): unparseable frame dropped");
            }
        }
    }

    fn set_state(
        state: &Arc<RwLock<ConnectionState>>,
        state_tx: &broadcast::Sender<ConnectionState>,
        next: ConnectionState,
    ) {
        {
            let mut guard = state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = next.clone();
        }
        let _ = state_tx.send(next);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn states(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn results(&self) -> broadcast::Receiver<CallOutcome> {
        self.results_tx.subscribe()
    }

    pub fn pushes(&self) -> broadcast::Receiver<SubscriptionPush> {
        self.push_tx.subscribe()
    }

    /// Ensure the socket is open before a call.
    ///
    /// Exactly one task drives a connect attempt at a time; concurrent
    /// callers wait for the next `Open` observation bounded by the connect
    /// timeout. The driving task issues up to `max_reconnects` reconnect
    /// triggers on observed closes before giving up with a connectivity
    /// error.
    pub async fn ensure_connected(&self) -> Result<(), RelayError> {
        if self.state().is_open() {
            return Ok(());
        }

        let Ok(_guard) = self.connect_gate.try_lock() else {
            return self.await_open().await;
        };
        if self.state().is_open() {
            return Ok(());
        }

        let mut states = self.state_tx.subscribe();
        let mut reconnects = 0u32;
        loop {
            if let Err(err) = self.socket.connect().await {
                log::debug!("relay({}): connect failed: {err}", self.name);
                if reconnects >= self.config.max_reconnects {
                    return Err(RelayError::NoConnectivity);
                }
                reconnects += 1;
                continue;
            }

            loop {
                match timeout(self.config.connect_timeout, states.recv()).await {
                    Err(_) => return Err(RelayError::timeout("connection establishment")),
                    Ok(Err(_)) => return Err(RelayError::transport("state stream closed")),
                    Ok(Ok(ConnectionState::Open)) => return Ok(()),
                    Ok(Ok(_)) => {
                        if reconnects >= self.config.max_reconnects {
                            log::warn!(
                                "relay({}): giving up after {} reconnects",
                                self.name,
                                reconnects
                            );
                            return Err(RelayError::NoConnectivity);
                        }
                        reconnects += 1;
                        log::debug!("relay({}): reconnect trigger {}", self.name, reconnects);
                        break;
                    }
                }
            }
        }
    }

    async fn await_open(&self) -> Result<(), RelayError> {
        let mut states = self.state_tx.subscribe();
        if self.state().is_open() {
            return Ok(());
        }
        let wait = async {
            loop {
                match states.recv().await {
                    Ok(ConnectionState::Open) => return Ok(()),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => {
                        if self.state().is_open() {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(RelayError::transport("state stream closed"))
                    }
                }
            }
        };
        timeout(self.config.connect_timeout, wait)
            .await
            .map_err(|_| RelayError::timeout("connection establishment"))?
    }

    /// One correlated relay call: ensure connection, send, await the result
    /// for this id on the shared stream, bounded by the call timeout. The
    /// send is not retried or undone on timeout.
    pub async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue, RelayError> {
        self.call_with_id(crate::rpc::generate_request_id(), method, params).await
    }

    pub async fn call_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: JsonValue,
    ) -> Result<JsonValue, RelayError> {
        self.ensure_connected().await?;

        // Subscribe before sending so the result cannot slip past us.
        let mut results = self.results_tx.subscribe();
        let frame = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|err| RelayError::wire(err.to_string()))?;
        self.socket.send(frame).await?;

        let wait = async {
            loop {
                match results.recv().await {
                    Ok(outcome) if outcome.id == id => return Ok(outcome.outcome),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("relay({}): result stream lagged by {missed}", self.name);
                    }
                    Err(RecvError::Closed) => {
                        return Err(RelayError::transport("result stream closed"))
                    }
                }
            }
        };
        match timeout(self.config.call_timeout, wait).await {
            Err(_) => Err(RelayError::timeout(method)),
            Ok(outcome) => Ok(outcome?.map_err(RelayError::from)?),
        }
    }

    pub async fn disconnect(&self) -> Result<(), RelayError> {
        self.socket.disconnect().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
