//! Full negotiation flows between two clients over the in-process relay:
//! pairing, propose/approve/settle, in-session traffic, lifetime management
//! and one-shot authentication.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use tacit_envelope::KeyedCodec;
use tacit_relay::{AlwaysOnline, ClientConfig, LifecycleManager, RelayClient, SubscriptionSet};
use tacit_sign::cacao::{canonical_message, Cacao, CacaoHeader, CacaoSignature};
use tacit_sign::client::SignClient;
use tacit_sign::{
    code, AuthPayload, Ed25519Verifier, PeerError, SignError, SignEvent, WalletServiceHandler,
};
use tacit_store::{
    InMemoryHistory, InMemoryKeyStore, InMemoryPairings, InMemoryProposals, InMemorySessions,
    PeerMetadata, ProposalNamespace, ProposalNamespaces, SessionNamespace, SessionNamespaces,
    SessionRepository, Topic,
};
use test_support::MockRelay;

const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_secs(2),
        max_reconnects: 3,
        batch_chunk_size: 500,
    }
}

fn metadata(name: &str) -> PeerMetadata {
    PeerMetadata {
        name: name.to_owned(),
        description: format!("{name} test client"),
        url: format!("https://{name}.example"),
        icons: Vec::new(),
        redirect: None,
    }
}

struct Peer {
    sign: Arc<SignClient>,
    sessions: Arc<InMemorySessions>,
}

fn peer(
    relay: &Arc<MockRelay>,
    name: &str,
    wallet_services: Vec<Arc<dyn WalletServiceHandler>>,
) -> Peer {
    let subscriptions = Arc::new(SubscriptionSet::new());
    let lifecycle = Arc::new(LifecycleManager::new(
        name,
        relay.socket(),
        subscriptions.clone(),
        test_config(),
    ));
    let keys = Arc::new(InMemoryKeyStore::new());
    let relay_client = RelayClient::new(
        name,
        lifecycle,
        Arc::new(KeyedCodec::new(keys.clone())),
        Arc::new(InMemoryHistory::new()),
        Arc::new(AlwaysOnline),
        subscriptions,
    );
    let sessions = Arc::new(InMemorySessions::new());
    let sign = SignClient::new(
        name,
        relay_client,
        keys,
        sessions.clone(),
        Arc::new(InMemoryProposals::new()),
        Arc::new(InMemoryPairings::new()),
        Arc::new(Ed25519Verifier),
        wallet_services,
        metadata(name),
    );
    Peer { sign, sessions }
}

fn required_namespaces() -> ProposalNamespaces {
    let mut namespaces = ProposalNamespaces::new();
    namespaces.insert(
        "eip155".to_owned(),
        ProposalNamespace {
            chains: vec!["eip155:1".to_owned()],
            methods: vec!["personal_sign".to_owned()],
            events: vec!["accountsChanged".to_owned()],
        },
    );
    namespaces
}

fn granted_namespaces() -> SessionNamespaces {
    let mut namespaces = SessionNamespaces::new();
    namespaces.insert(
        "eip155".to_owned(),
        SessionNamespace {
            chains: Vec::new(),
            accounts: vec!["eip155:1:0xab5801a7d398351b8be11c439e05c5b3259aec9b".to_owned()],
            methods: vec!["personal_sign".to_owned()],
            events: vec!["accountsChanged".to_owned()],
        },
    );
    namespaces
}

async fn await_event<T>(
    events: &mut broadcast::Receiver<SignEvent>,
    pick: impl Fn(SignEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("expected event within the wait window")
}

/// Pair the two clients and settle a session; returns the session topic.
async fn settle_session(dapp: &Peer, wallet: &Peer) -> Topic {
    let mut dapp_events = dapp.sign.events();
    let mut wallet_events = wallet.sign.events();

    let (_pairing_topic, uri) = wallet.sign.create_pairing().await.expect("create pairing");
    let pairing_topic = dapp.sign.pair(&uri).await.expect("pair");

    dapp.sign
        .propose_session(&pairing_topic, required_namespaces(), None)
        .await
        .expect("propose");

    let proposal = await_event(&mut wallet_events, |event| match event {
        SignEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;

    wallet
        .sign
        .approve_session(proposal.request_id, granted_namespaces())
        .await
        .expect("approve");

    let session = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionSettled { session } => Some(session),
        _ => None,
    })
    .await;
    session.topic
}

#[tokio::test]
async fn propose_approve_settle_and_exchange_requests() {
    let relay = MockRelay::new();
    let dapp = peer(&relay, "dapp", Vec::new());
    let wallet = peer(&relay, "wallet", Vec::new());

    let mut dapp_events = dapp.sign.events();
    let mut wallet_events = wallet.sign.events();
    let topic = settle_session(&dapp, &wallet).await;

    // Both sides hold the same session record.
    let dapp_session = dapp.sessions.get(&topic).await.expect("query").expect("session");
    let wallet_session = wallet.sessions.get(&topic).await.expect("query").expect("session");
    assert_eq!(dapp_session.namespaces, wallet_session.namespaces);
    assert_eq!(dapp_session.peer_public_key, wallet_session.self_public_key);

    // Namespace-gated request round trip.
    let id = dapp
        .sign
        .request(&topic, "eip155:1", "personal_sign", json!(["0xdead", "0xbeef"]), None)
        .await
        .expect("request");

    let (req_id, method) = await_event(&mut wallet_events, |event| match event {
        SignEvent::SessionRequest { id, method, .. } => Some((id, method)),
        _ => None,
    })
    .await;
    assert_eq!(req_id, id);
    assert_eq!(method, "personal_sign");

    wallet.sign.respond(&topic, req_id, Ok(json!("0xsigned"))).await.expect("respond");

    let outcome = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionResponse { id, outcome, .. } if id == req_id => Some(outcome),
        _ => None,
    })
    .await;
    assert_eq!(outcome, Ok(json!("0xsigned")));

    // A method outside the granted namespaces never leaves the client.
    let err = dapp
        .sign
        .request(&topic, "eip155:1", "eth_sendTransaction", json!([]), None)
        .await
        .expect_err("unauthorized method");
    assert!(matches!(err, SignError::Unauthorized { .. }));
}

#[tokio::test]
async fn rejection_reaches_the_proposer() {
    let relay = MockRelay::new();
    let dapp = peer(&relay, "dapp", Vec::new());
    let wallet = peer(&relay, "wallet", Vec::new());

    let mut dapp_events = dapp.sign.events();
    let mut wallet_events = wallet.sign.events();

    let (_topic, uri) = wallet.sign.create_pairing().await.expect("create pairing");
    let pairing_topic = dapp.sign.pair(&uri).await.expect("pair");
    let proposal_id = dapp
        .sign
        .propose_session(&pairing_topic, required_namespaces(), None)
        .await
        .expect("propose");

    let proposal = await_event(&mut wallet_events, |event| match event {
        SignEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;
    wallet
        .sign
        .reject_session(proposal.request_id, PeerError::user_rejected())
        .await
        .expect("reject");

    let (id, reason) = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionRejected { id, reason } => Some((id, reason)),
        _ => None,
    })
    .await;
    assert_eq!(id, proposal_id);
    assert_eq!(reason.code, code::USER_REJECTED);
}

#[tokio::test]
async fn update_extend_and_disconnect_propagate() {
    let relay = MockRelay::new();
    let dapp = peer(&relay, "dapp", Vec::new());
    let wallet = peer(&relay, "wallet", Vec::new());

    let mut dapp_events = dapp.sign.events();
    let topic = settle_session(&dapp, &wallet).await;

    // Update from the controller side replaces the map on both ends.
    let mut widened = granted_namespaces();
    widened
        .get_mut("eip155")
        .expect("namespace")
        .methods
        .push("eth_signTypedData".to_owned());
    wallet.sign.update(&topic, widened.clone()).await.expect("update");

    let namespaces = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionUpdated { namespaces, .. } => Some(namespaces),
        _ => None,
    })
    .await;
    assert_eq!(namespaces, widened);
    let stored = dapp.sessions.get(&topic).await.expect("query").expect("session");
    assert_eq!(stored.namespaces, widened);

    // Extend pushes the expiry forward on the peer as well.
    let before = stored.expiry;
    wallet.sign.extend(&topic).await.expect("extend");
    let expiry = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionExtended { expiry, .. } => Some(expiry),
        _ => None,
    })
    .await;
    assert!(expiry >= before);

    // Disconnect tears the session down on both sides.
    dapp.sign.disconnect(&topic).await.expect("disconnect");
    let mut wallet_events = wallet.sign.events();
    // The wallet may have already processed the delete; poll its store.
    let gone = timeout(WAIT, async {
        loop {
            if wallet.sessions.get(&topic).await.expect("query").is_none() {
                return;
            }
            match timeout(Duration::from_millis(50), wallet_events.recv()).await {
                Ok(_) | Err(_) => continue,
            }
        }
    })
    .await;
    assert!(gone.is_ok(), "wallet must drop the session");
    assert!(dapp.sessions.get(&topic).await.expect("query").is_none());
}

#[tokio::test]
async fn ping_and_events_round_trip() {
    let relay = MockRelay::new();
    let dapp = peer(&relay, "dapp", Vec::new());
    let wallet = peer(&relay, "wallet", Vec::new());

    let mut dapp_events = dapp.sign.events();
    let topic = settle_session(&dapp, &wallet).await;

    dapp.sign.ping(&topic).await.expect("ping");
    await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionPingResponded { .. } => Some(()),
        _ => None,
    })
    .await;

    wallet
        .sign
        .emit(&topic, "eip155:1", "accountsChanged", json!(["0xab"]))
        .await
        .expect("emit");
    let (name, data) = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionEvent { name, data, .. } => Some((name, data)),
        _ => None,
    })
    .await;
    assert_eq!(name, "accountsChanged");
    assert_eq!(data, json!(["0xab"]));

    let err = wallet
        .sign
        .emit(&topic, "eip155:1", "chainChanged", json!({}))
        .await
        .expect_err("unauthorized event");
    assert!(matches!(err, SignError::Unauthorized { .. }));
}

fn sign_cacao(signing: &SigningKey, payload: &AuthPayload) -> Cacao {
    let address = hex::encode(signing.verifying_key().to_bytes());
    let cacao_payload = Cacao::payload_for(payload, format!("did:pkh:eip155:1:{address}"));
    let signature = signing.sign(canonical_message(&cacao_payload).as_bytes());
    Cacao {
        header: CacaoHeader { kind: "caip122".to_owned() },
        payload: cacao_payload,
        signature: CacaoSignature {
            kind: "ed25519".to_owned(),
            signature: hex::encode(signature.to_bytes()),
        },
    }
}

fn auth_payload() -> AuthPayload {
    AuthPayload {
        kind: "caip122".to_owned(),
        domain: "dapp.example".to_owned(),
        aud: "https://dapp.example/login".to_owned(),
        nonce: "8844".to_owned(),
        iat: "2026-08-28T09:00:00Z".to_owned(),
        chains: vec!["eip155:1".to_owned()],
        statement: None,
        exp: None,
        nbf: None,
        resources: Vec::new(),
    }
}

#[tokio::test]
async fn authenticate_synthesizes_a_session_from_cacaos() {
    let relay = MockRelay::new();
    let dapp = peer(&relay, "dapp", Vec::new());
    let wallet = peer(&relay, "wallet", Vec::new());

    let mut dapp_events = dapp.sign.events();
    let mut wallet_events = wallet.sign.events();

    let (_topic, uri) = wallet.sign.create_pairing().await.expect("create pairing");
    let pairing_topic = dapp.sign.pair(&uri).await.expect("pair");

    dapp.sign.authenticate(&pairing_topic, auth_payload()).await.expect("authenticate");

    let (auth_id, payload) = await_event(&mut wallet_events, |event| match event {
        SignEvent::SessionAuthenticateRequest { id, payload, .. } => Some((id, payload)),
        _ => None,
    })
    .await;

    let signing = SigningKey::generate(&mut rand_core::OsRng);
    let cacao = sign_cacao(&signing, &payload);
    let wallet_session = wallet
        .sign
        .approve_session_authenticate(auth_id, vec![cacao])
        .await
        .expect("approve authenticate");

    let dapp_session = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionAuthenticated { session } => Some(session),
        _ => None,
    })
    .await;

    assert_eq!(dapp_session.topic, wallet_session.topic);
    let accounts = &dapp_session.namespaces.get("eip155").expect("namespace").accounts;
    assert_eq!(accounts.len(), 1);
    assert!(accounts[0].starts_with("eip155:1:"));
}

#[tokio::test]
async fn one_bad_cacao_voids_the_whole_approval() {
    let relay = MockRelay::new();
    let dapp = peer(&relay, "dapp", Vec::new());
    let wallet = peer(&relay, "wallet", Vec::new());

    let mut wallet_events = wallet.sign.events();

    let (_topic, uri) = wallet.sign.create_pairing().await.expect("create pairing");
    let pairing_topic = dapp.sign.pair(&uri).await.expect("pair");
    dapp.sign.authenticate(&pairing_topic, auth_payload()).await.expect("authenticate");

    let (auth_id, payload) = await_event(&mut wallet_events, |event| match event {
        SignEvent::SessionAuthenticateRequest { id, payload, .. } => Some((id, payload)),
        _ => None,
    })
    .await;

    let signing = SigningKey::generate(&mut rand_core::OsRng);
    let good = sign_cacao(&signing, &payload);
    let mut bad = sign_cacao(&signing, &payload);
    bad.payload.nonce = "forged".to_owned();

    let publishes_before = relay.publish_count();
    let err = wallet
        .sign
        .approve_session_authenticate(auth_id, vec![good, bad])
        .await
        .expect_err("tampered cacao");
    assert!(matches!(err, SignError::InvalidCacao { .. }));
    // Nothing was published and no session exists on either side.
    assert_eq!(relay.publish_count(), publishes_before);
    assert!(wallet.sessions.list().await.expect("list").is_empty());
    assert!(dapp.sessions.list().await.expect("list").is_empty());
}

struct AssetService;

#[async_trait::async_trait]
impl WalletServiceHandler for AssetService {
    fn handles(&self, method: &str) -> bool {
        method == "wallet_getAssets"
    }

    async fn handle(
        &self,
        _topic: &Topic,
        _chain_id: &str,
        _method: &str,
        _params: &serde_json::Value,
    ) -> Result<serde_json::Value, PeerError> {
        Ok(json!({"assets": ["0xtoken"]}))
    }
}

#[tokio::test]
async fn wallet_service_intercepts_before_publishing() {
    let relay = MockRelay::new();
    let wallet = peer(&relay, "wallet", Vec::new());
    let dapp = peer(&relay, "dapp", vec![Arc::new(AssetService) as Arc<dyn WalletServiceHandler>]);

    let mut dapp_events = dapp.sign.events();
    let topic = settle_session(&dapp, &wallet).await;

    // The service method must still be inside the granted namespaces.
    let mut widened = granted_namespaces();
    widened.get_mut("eip155").expect("namespace").methods.push("wallet_getAssets".to_owned());
    wallet.sign.update(&topic, widened).await.expect("update");
    await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionUpdated { .. } => Some(()),
        _ => None,
    })
    .await;

    let publishes_before = relay.publish_count();
    let id = dapp
        .sign
        .request(&topic, "eip155:1", "wallet_getAssets", json!({}), None)
        .await
        .expect("request");

    let outcome = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionResponse { id: got, outcome, .. } if got == id => Some(outcome),
        _ => None,
    })
    .await;
    assert_eq!(outcome, Ok(json!({"assets": ["0xtoken"]})));
    assert_eq!(relay.publish_count(), publishes_before, "request must not hit the relay");
}

#[tokio::test]
async fn expiry_sweep_prunes_dead_sessions() {
    let relay = MockRelay::new();
    let dapp = peer(&relay, "dapp", Vec::new());
    let wallet = peer(&relay, "wallet", Vec::new());

    let mut dapp_events = dapp.sign.events();
    let topic = settle_session(&dapp, &wallet).await;

    // Age the session artificially, then sweep.
    dapp.sessions.update_expiry(&topic, 1).await.expect("age session");
    dapp.sign.sweep_expired().await.expect("sweep");

    let expired = await_event(&mut dapp_events, |event| match event {
        SignEvent::SessionExpired { topic } => Some(topic),
        _ => None,
    })
    .await;
    assert_eq!(expired, topic);
    assert!(dapp.sessions.get(&topic).await.expect("query").is_none());

    let err = dapp
        .sign
        .request(&topic, "eip155:1", "personal_sign", json!([]), None)
        .await
        .expect_err("session is gone");
    assert!(matches!(err, SignError::UnknownSession { .. }));
}
