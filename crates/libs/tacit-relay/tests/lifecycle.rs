//! Connection lifecycle tests: reconnect budget, call timeouts and the
//! subscription reset on observed closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use tacit_relay::{
    ClientConfig, ConnectionState, LifecycleManager, RelayError, RelaySocket, SocketEvent,
    SubscriptionSet,
};
use tacit_store::Topic;
use test_support::MockRelay;

fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_millis(300),
        max_reconnects: 3,
        batch_chunk_size: 500,
    }
}

fn manager(relay: &Arc<MockRelay>) -> (Arc<LifecycleManager>, Arc<SubscriptionSet>) {
    let subscriptions = Arc::new(SubscriptionSet::new());
    let lifecycle = Arc::new(LifecycleManager::new(
        "test",
        relay.socket(),
        subscriptions.clone(),
        test_config(),
    ));
    (lifecycle, subscriptions)
}

/// A socket that opens fine but never answers anything.
struct SilentSocket {
    events_tx: broadcast::Sender<SocketEvent>,
}

impl SilentSocket {
    fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(16);
        Arc::new(Self { events_tx })
    }
}

#[async_trait]
impl RelaySocket for SilentSocket {
    async fn connect(&self) -> Result<(), RelayError> {
        let _ = self.events_tx.send(SocketEvent::Opened);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        Ok(())
    }

    async fn send(&self, _frame: String) -> Result<(), RelayError> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.events_tx.subscribe()
    }
}

#[tokio::test]
async fn connect_reaches_open() {
    let relay = MockRelay::new();
    let (lifecycle, _) = manager(&relay);
    lifecycle.ensure_connected().await.expect("connect");
    assert_eq!(lifecycle.state(), ConnectionState::Open);
}

#[tokio::test]
async fn reconnect_budget_absorbs_transient_refusals() {
    let relay = MockRelay::new();
    relay.reject_next_connects(3);
    let (lifecycle, _) = manager(&relay);
    lifecycle.ensure_connected().await.expect("third retry succeeds");
    assert!(lifecycle.state().is_open());
}

#[tokio::test]
async fn reconnect_budget_is_bounded() {
    let relay = MockRelay::new();
    relay.reject_next_connects(4);
    let (lifecycle, _) = manager(&relay);
    let err = lifecycle.ensure_connected().await.expect_err("budget exhausted");
    assert!(matches!(err, RelayError::NoConnectivity));
}

#[tokio::test]
async fn call_times_out_when_the_relay_stays_silent() {
    let subscriptions = Arc::new(SubscriptionSet::new());
    let lifecycle =
        LifecycleManager::new("test", SilentSocket::new(), subscriptions, test_config());
    let err = lifecycle.call("irn_publish", json!({})).await.expect_err("no reply");
    assert!(matches!(err, RelayError::Timeout { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn relay_error_responses_surface_as_json_rpc_errors() {
    let relay = MockRelay::new();
    let (lifecycle, _) = manager(&relay);
    let err = lifecycle.call("irn_bogus", json!({})).await.expect_err("unknown method");
    match err {
        RelayError::JsonRpc { code, .. } => assert_eq!(code, -32601),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn observed_close_invalidates_acknowledged_subscriptions() {
    let relay = MockRelay::new();
    let (lifecycle, subscriptions) = manager(&relay);
    lifecycle.ensure_connected().await.expect("connect");

    subscriptions.insert(Topic::generate(), "mock-sub-1".to_owned());
    assert!(!subscriptions.is_empty());

    relay.disconnect_all("maintenance");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(subscriptions.is_empty(), "ids must not survive the connection");
    assert!(matches!(lifecycle.state(), ConnectionState::Closed { .. }));
}
