//! End-to-end tests of the encrypted request/response layer over the
//! in-process mock relay.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use tacit_envelope::{seal_envelope, EnvelopeType, KeyedCodec};
use tacit_relay::rpc::{method, PublishParams, RpcResult};
use tacit_relay::{
    AlwaysOnline, ClientConfig, InternalError, LifecycleManager, OutboundRequest, RelayClient,
    RelayError, SubscriptionSet,
};
use tacit_store::{InMemoryHistory, InMemoryKeyStore, KeyStore, SymKey, Topic, TransportType};
use test_support::{MockRelay, MockSocket};

const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_secs(2),
        max_reconnects: 3,
        batch_chunk_size: 4,
    }
}

struct Harness {
    client: Arc<RelayClient>,
    keys: Arc<InMemoryKeyStore>,
    socket: Arc<MockSocket>,
}

fn harness(relay: &Arc<MockRelay>, name: &str) -> Harness {
    let socket = relay.socket();
    let subscriptions = Arc::new(SubscriptionSet::new());
    let lifecycle = Arc::new(LifecycleManager::new(
        name,
        socket.clone(),
        subscriptions.clone(),
        test_config(),
    ));
    let keys = Arc::new(InMemoryKeyStore::new());
    let client = RelayClient::new(
        name,
        lifecycle,
        Arc::new(KeyedCodec::new(keys.clone())),
        Arc::new(InMemoryHistory::new()),
        Arc::new(AlwaysOnline),
        subscriptions,
    );
    Harness { client, keys, socket }
}

async fn shared_topic(a: &Harness, b: &Harness) -> (Topic, SymKey) {
    let key = SymKey([7u8; 32]);
    let topic = tacit_envelope::topic_from_key(&key);
    a.keys.set_key(&topic, key.clone()).await.expect("store key");
    b.keys.set_key(&topic, key.clone()).await.expect("store key");
    (topic, key)
}

fn ping_request(id: u64, topic: &Topic) -> OutboundRequest {
    OutboundRequest {
        id,
        topic: topic.clone(),
        method: "wc_sessionPing".to_owned(),
        params: json!({}),
        tag: 1114,
        ttl: 30,
        envelope: EnvelopeType::Type0,
        transport_type: TransportType::Relay,
        correlation_id: None,
    }
}

#[tokio::test]
async fn request_and_response_round_trip() {
    let relay = MockRelay::new();
    let alice = harness(&relay, "alice");
    let bob = harness(&relay, "bob");
    let (topic, _) = shared_topic(&alice, &bob).await;

    alice.client.subscribe(&topic).await.expect("alice subscribe");
    bob.client.subscribe(&topic).await.expect("bob subscribe");

    let mut bob_requests = bob.client.requests();
    let mut alice_responses = alice.client.responses();

    alice.client.publish_request(ping_request(1001, &topic)).await.expect("publish");

    let inbound = timeout(WAIT, bob_requests.recv()).await.expect("await").expect("recv");
    assert_eq!(inbound.id, 1001);
    assert_eq!(inbound.method, "wc_sessionPing");
    assert_eq!(inbound.topic, topic);

    bob.client
        .publish_response(&topic, 1001, Ok(json!(true)), 1115, 30)
        .await
        .expect("respond");

    let response = timeout(WAIT, alice_responses.recv()).await.expect("await").expect("recv");
    assert_eq!(response.id, 1001);
    assert_eq!(response.method, "wc_sessionPing");
    assert_eq!(response.outcome, Ok(json!(true)));
}

#[tokio::test]
async fn in_flight_request_is_published_once() {
    let relay = MockRelay::new();
    let alice = harness(&relay, "alice");
    let bob = harness(&relay, "bob");
    let (topic, _) = shared_topic(&alice, &bob).await;
    alice.client.subscribe(&topic).await.expect("subscribe");

    alice.client.publish_request(ping_request(2001, &topic)).await.expect("first publish");
    alice.client.publish_request(ping_request(2001, &topic)).await.expect("second publish");

    assert_eq!(relay.publish_count(), 1);
}

#[tokio::test]
async fn redelivered_request_is_dropped_as_duplicate() {
    let relay = MockRelay::new();
    let alice = harness(&relay, "alice");
    let bob = harness(&relay, "bob");
    let (topic, _) = shared_topic(&alice, &bob).await;

    bob.client.subscribe(&topic).await.expect("subscribe");
    let mut bob_requests = bob.client.requests();

    alice.client.publish_request(ping_request(3001, &topic)).await.expect("publish");
    let first = timeout(WAIT, bob_requests.recv()).await.expect("await").expect("recv");
    assert_eq!(first.id, 3001);

    // Drop the connection; the re-subscription replays the retained backlog.
    bob.socket.force_close("network blip");
    tokio::time::sleep(Duration::from_millis(50)).await;
    bob.client.subscribe(&topic).await.expect("resubscribe");

    // The replayed request correlates to the existing history record and is
    // not surfaced a second time.
    let redelivery = timeout(Duration::from_millis(300), bob_requests.recv()).await;
    assert!(redelivery.is_err(), "duplicate request must not be dispatched");
}

#[tokio::test]
async fn batch_subscribe_chunks_by_protocol_limit() {
    let relay = MockRelay::new();
    let alice = harness(&relay, "alice");
    let topics: Vec<Topic> = (0..10).map(|_| Topic::generate()).collect();

    let ids = alice.client.batch_subscribe(&topics).await.expect("batch subscribe");
    assert_eq!(ids.len(), 10);
    assert_eq!(relay.batch_call_sizes(), vec![4, 4, 2]);
    for topic in &topics {
        assert!(alice.client.subscriptions().contains(topic));
        assert_eq!(relay.subscriber_count(topic), 1);
    }
}

#[tokio::test]
async fn batch_subscribe_failure_keeps_committed_chunks() {
    let relay = MockRelay::new();
    relay.fail_batch_call(2);
    let alice = harness(&relay, "alice");
    let topics: Vec<Topic> = (0..10).map(|_| Topic::generate()).collect();

    let err = alice.client.batch_subscribe(&topics).await.expect_err("chunk 2 fails");
    assert!(matches!(err, RelayError::JsonRpc { .. }), "unexpected error: {err}");

    // Chunk 1 acknowledged before the failure and stays committed.
    for topic in &topics[..4] {
        assert!(alice.client.subscriptions().contains(topic));
    }
    // The failing chunk is never committed.
    for topic in &topics[4..8] {
        assert!(!alice.client.subscriptions().contains(topic));
    }
}

#[tokio::test]
async fn unsubscribe_forgets_topic_state_exactly_once() {
    let relay = MockRelay::new();
    let alice = harness(&relay, "alice");
    let bob = harness(&relay, "bob");
    let (topic, _) = shared_topic(&alice, &bob).await;

    bob.client.subscribe(&topic).await.expect("subscribe");
    let mut bob_requests = bob.client.requests();

    alice.client.publish_request(ping_request(4001, &topic)).await.expect("publish");
    timeout(WAIT, bob_requests.recv()).await.expect("await").expect("recv");

    bob.client.unsubscribe(&topic).await.expect("unsubscribe");
    assert!(!bob.client.subscriptions().contains(&topic));
    assert_eq!(relay.subscriber_count(&topic), 0);

    let err = bob.client.unsubscribe(&topic).await.expect_err("second unsubscribe");
    assert!(matches!(err, RelayError::NotSubscribed { .. }));

    // Later traffic on the forgotten topic never reaches the request stream.
    alice.client.publish_request(ping_request(4002, &topic)).await.expect("publish");
    let silence = timeout(Duration::from_millis(300), bob_requests.recv()).await;
    assert!(silence.is_err());
}

#[tokio::test]
async fn reconnect_restores_tracked_subscriptions() {
    let relay = MockRelay::new();
    let alice = harness(&relay, "alice");
    let bob = harness(&relay, "bob");
    let (topic, _) = shared_topic(&alice, &bob).await;

    bob.client.subscribe(&topic).await.expect("subscribe");
    let extra: Vec<Topic> = (0..3).map(|_| Topic::generate()).collect();
    bob.client.batch_subscribe(&extra).await.expect("batch subscribe");

    bob.socket.force_close("outage");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.subscriber_count(&topic), 0);

    // The next connection restores every tracked topic without the caller
    // re-subscribing by hand.
    bob.client.lifecycle().ensure_connected().await.expect("reconnect");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.subscriber_count(&topic), 1);
    for topic in &extra {
        assert_eq!(relay.subscriber_count(topic), 1);
    }

    // Traffic flows again end to end.
    let mut bob_requests = bob.client.requests();
    alice.client.publish_request(ping_request(6001, &topic)).await.expect("publish");
    let inbound = timeout(WAIT, bob_requests.recv()).await.expect("await").expect("recv");
    assert_eq!(inbound.id, 6001);
}

#[tokio::test]
async fn unsolicited_response_is_reported_not_dispatched() {
    let relay = MockRelay::new();
    let alice = harness(&relay, "alice");
    let bob = harness(&relay, "bob");
    let (topic, key) = shared_topic(&alice, &bob).await;

    bob.client.subscribe(&topic).await.expect("subscribe");
    let mut bob_errors = bob.client.internal_errors();
    let mut bob_responses = bob.client.responses();

    // A result for an id bob never sent.
    let body = serde_json::to_string(&RpcResult::new(5001, json!({"ok": true}))).expect("body");
    let sealed = seal_envelope(&key, &body, &EnvelopeType::Type0).expect("seal");
    alice
        .client
        .lifecycle()
        .call(
            method::PUBLISH,
            serde_json::to_value(PublishParams {
                topic: topic.clone(),
                message: sealed,
                ttl: 30,
                tag: 1115,
                correlation_id: None,
            })
            .expect("params"),
        )
        .await
        .expect("publish");

    let error = timeout(WAIT, bob_errors.recv()).await.expect("await").expect("recv");
    assert_eq!(error, InternalError::UnmatchedResponse { topic: topic.clone(), id: 5001 });

    // The session-approval result shape is the one unmatched response that
    // is still forwarded.
    let body = serde_json::to_string(&RpcResult::new(
        5002,
        json!({"responderPublicKey": "aa", "responseTopic": "bb"}),
    ))
    .expect("body");
    let sealed = seal_envelope(&key, &body, &EnvelopeType::Type0).expect("seal");
    alice
        .client
        .lifecycle()
        .call(
            method::PUBLISH,
            serde_json::to_value(PublishParams {
                topic: topic.clone(),
                message: sealed,
                ttl: 30,
                tag: 1101,
                correlation_id: None,
            })
            .expect("params"),
        )
        .await
        .expect("publish");

    let forwarded = timeout(WAIT, bob_responses.recv()).await.expect("await").expect("recv");
    assert_eq!(forwarded.id, 5002);
    assert_eq!(forwarded.method, method::APPROVE_SESSION);
}
