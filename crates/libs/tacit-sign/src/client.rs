use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand_core::{OsRng, RngCore};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use tacit_envelope::{derive_sym_key, generate_keypair, topic_from_key, EnvelopeType};
use tacit_relay::{generate_request_id, RelayClient};
use tacit_store::{
    KeyStore, Pairing, PairingRepository, PeerMetadata, Proposal, ProposalNamespaces,
    ProposalRepository, RequestId, Session, SessionNamespaces, SessionRepository, SymKey, Topic,
    TransportType,
};

use crate::cacao::{AuthPayload, Cacao, CacaoVerifier};
use crate::error::{PeerError, SignError};
use crate::events::SignEvent;
use crate::namespaces::{
    ensure_conforms, event_authorized, merge_namespaces, method_authorized,
    validate_proposal_namespaces,
};
use crate::protocol::{
    unix_now, PairingUri, Participant, RelayProtocol, SessionAuthenticateParams,
    SessionDeleteParams, SessionEventBody, SessionEventParams, SessionProposeParams,
    SessionProposeResponse, SessionRequestBody, SessionRequestParams, SessionSettleParams,
    SessionUpdateParams, SignMethod, AUTH_TTL, PAIRING_TTL_ACTIVE, PAIRING_TTL_INACTIVE,
    PROPOSAL_TTL, SESSION_TTL,
};
use crate::redirect::WalletServiceHandler;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Disconnect code sent when this side tears a session or pairing down.
const USER_DISCONNECTED: i64 = 6000;

/// Session settled on our side, awaiting the peer's settle call.
#[derive(Clone, Debug)]
pub(crate) struct PendingSettlement {
    pub proposal_id: RequestId,
    pub pairing_topic: Topic,
    pub self_public_key: String,
}

/// Inbound authenticate request we have not answered yet.
#[derive(Clone, Debug)]
pub(crate) struct PendingAuthRequest {
    pub topic: Topic,
    pub requester: Participant,
    pub payload: AuthPayload,
    pub expiry: i64,
}

/// Outbound authenticate request awaiting the peer's decision.
#[derive(Clone, Debug)]
pub(crate) struct OwnAuthRequest {
    pub pairing_topic: Topic,
    pub self_public_key: String,
}

/// The session protocol engine: pairing bootstrap, session negotiation,
/// request routing and lifetime management, on top of [`RelayClient`].
pub struct SignClient {
    pub(crate) name: String,
    pub(crate) relay: Arc<RelayClient>,
    pub(crate) keys: Arc<dyn KeyStore>,
    pub(crate) sessions: Arc<dyn SessionRepository>,
    pub(crate) proposals: Arc<dyn ProposalRepository>,
    pub(crate) pairings: Arc<dyn PairingRepository>,
    pub(crate) verifier: Arc<dyn CacaoVerifier>,
    pub(crate) wallet_services: Vec<Arc<dyn WalletServiceHandler>>,
    pub(crate) metadata: PeerMetadata,
    pub(crate) pending_settlements: Mutex<BTreeMap<Topic, PendingSettlement>>,
    /// Inbound session request id to its expiry, used to refuse late answers.
    pub(crate) pending_requests: Mutex<BTreeMap<RequestId, i64>>,
    pub(crate) pending_auth: Mutex<BTreeMap<RequestId, PendingAuthRequest>>,
    pub(crate) own_auth: Mutex<BTreeMap<RequestId, OwnAuthRequest>>,
    pub(crate) events_tx: broadcast::Sender<SignEvent>,
    cancel: CancellationToken,
}

impl SignClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        relay: Arc<RelayClient>,
        keys: Arc<dyn KeyStore>,
        sessions: Arc<dyn SessionRepository>,
        proposals: Arc<dyn ProposalRepository>,
        pairings: Arc<dyn PairingRepository>,
        verifier: Arc<dyn CacaoVerifier>,
        wallet_services: Vec<Arc<dyn WalletServiceHandler>>,
        metadata: PeerMetadata,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = Arc::new(Self {
            name: name.into(),
            relay: relay.clone(),
            keys,
            sessions,
            proposals,
            pairings,
            verifier,
            wallet_services,
            metadata,
            pending_settlements: Mutex::new(BTreeMap::new()),
            pending_requests: Mutex::new(BTreeMap::new()),
            pending_auth: Mutex::new(BTreeMap::new()),
            own_auth: Mutex::new(BTreeMap::new()),
            events_tx,
            cancel: CancellationToken::new(),
        });
        Self::spawn_dispatcher(Arc::downgrade(&client), relay);
        client
    }

    fn spawn_dispatcher(weak: Weak<Self>, relay: Arc<RelayClient>) {
        let mut requests = relay.requests();
        let mut responses = relay.responses();
        let cancel = match weak.upgrade() {
            Some(client) => client.cancel.clone(),
            None => return,
        };
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = requests.recv() => match request {
                        Ok(request) => {
                            let Some(client) = weak.upgrade() else { break };
                            client.handle_request(request).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("sign: request stream lagged by {missed}");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    response = responses.recv() => match response {
                        Ok(response) => {
                            let Some(client) = weak.upgrade() else { break };
                            client.handle_response(response).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("sign: response stream lagged by {missed}");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = sweep.tick() => {
                        let Some(client) = weak.upgrade() else { break };
                        if let Err(err) = client.sweep_expired().await {
                            log::warn!("sign({}): expiry sweep failed: {err}", client.name);
                        }
                    }
                }
            }
        });
    }

    pub fn events(&self) -> broadcast::Receiver<SignEvent> {
        self.events_tx.subscribe()
    }

    pub fn relay(&self) -> &Arc<RelayClient> {
        &self.relay
    }

    pub fn metadata(&self) -> &PeerMetadata {
        &self.metadata
    }

    // ── Pairing bootstrap ─────────────────────────────────────────────────────

    /// Mint a fresh pairing: random symmetric key, topic derived from it,
    /// subscription opened. Returns the topic and the out-of-band URI.
    pub async fn create_pairing(&self) -> Result<(Topic, String), SignError> {
        let mut key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let key = SymKey(key_bytes);
        let topic = topic_from_key(&key);
        let expiry = unix_now() + PAIRING_TTL_INACTIVE;

        self.keys.set_key(&topic, key).await?;
        self.pairings
            .insert(Pairing { topic: topic.clone(), expiry, active: false, peer_metadata: None })
            .await?;
        self.relay.subscribe(&topic).await?;

        let uri =
            PairingUri { topic: topic.clone(), sym_key: key_bytes, expiry: Some(expiry) }.render();
        log::info!("sign({}): pairing {topic} created", self.name);
        Ok((topic, uri))
    }

    /// Adopt a pairing minted by a peer.
    pub async fn pair(&self, uri: &str) -> Result<Topic, SignError> {
        let parsed = PairingUri::parse(uri)?;
        let expiry = parsed.expiry.unwrap_or_else(|| unix_now() + PAIRING_TTL_INACTIVE);
        if expiry <= unix_now() {
            return Err(SignError::InvalidUri { reason: "pairing already expired".to_owned() });
        }

        self.keys.set_key(&parsed.topic, SymKey(parsed.sym_key)).await?;
        self.pairings
            .insert(Pairing {
                topic: parsed.topic.clone(),
                expiry,
                active: false,
                peer_metadata: None,
            })
            .await?;
        self.relay.subscribe(&parsed.topic).await?;
        log::info!("sign({}): paired over {}", self.name, parsed.topic);
        Ok(parsed.topic)
    }

    pub async fn delete_pairing(&self, topic: &Topic) -> Result<(), SignError> {
        if self.pairings.get(topic).await?.is_none() {
            return Err(SignError::UnknownPairing { topic: topic.clone() });
        }
        let params = SessionDeleteParams {
            code: USER_DISCONNECTED,
            message: "User disconnected".to_owned(),
        };
        self.publish_call(topic, SignMethod::PairingDelete, serde_json::to_value(&params)?)
            .await?;
        self.forget_pairing(topic).await?;
        let _ = self.events_tx.send(SignEvent::PairingDeleted { topic: topic.clone() });
        Ok(())
    }

    // ── Session negotiation ───────────────────────────────────────────────────

    /// Propose a session over an existing pairing. The returned id correlates
    /// the eventual approval or rejection.
    pub async fn propose_session(
        &self,
        pairing_topic: &Topic,
        required_namespaces: ProposalNamespaces,
        optional_namespaces: Option<ProposalNamespaces>,
    ) -> Result<RequestId, SignError> {
        validate_proposal_namespaces(&required_namespaces)?;
        if let Some(optional) = &optional_namespaces {
            if !optional.is_empty() {
                validate_proposal_namespaces(optional)?;
            }
        }
        if self.pairings.get(pairing_topic).await?.is_none() {
            return Err(SignError::UnknownPairing { topic: pairing_topic.clone() });
        }

        let keypair = generate_keypair();
        let public_key = keypair.public_key.clone();
        self.keys.set_keypair(keypair).await?;

        let expiry = unix_now() + PROPOSAL_TTL;
        let params = SessionProposeParams {
            relays: vec![RelayProtocol::irn()],
            proposer: Participant {
                public_key: public_key.clone(),
                metadata: self.metadata.clone(),
            },
            required_namespaces: required_namespaces.clone(),
            optional_namespaces: optional_namespaces.clone(),
            session_properties: None,
            scoped_properties: None,
            expiry_timestamp: expiry,
        };
        let id = self
            .publish_call(pairing_topic, SignMethod::SessionPropose, serde_json::to_value(&params)?)
            .await?;

        self.proposals
            .insert(Proposal {
                request_id: id,
                pairing_topic: pairing_topic.clone(),
                proposer_public_key: public_key,
                proposer_metadata: self.metadata.clone(),
                required_namespaces,
                optional_namespaces,
                properties: None,
                scoped_properties: None,
                expiry,
            })
            .await?;
        log::info!("sign({}): proposed session {id} over {pairing_topic}", self.name);
        Ok(id)
    }

    /// Approve a stored proposal: settle the session on a fresh derived topic
    /// and answer the proposer over the pairing.
    ///
    /// The proposal is only consumed once both the settle publish and the
    /// approval response succeed; on a partial failure the derived state is
    /// rolled back and the proposal stays answerable.
    pub async fn approve_session(
        &self,
        proposal_id: RequestId,
        granted: SessionNamespaces,
    ) -> Result<Session, SignError> {
        let proposal = self
            .proposals
            .get(proposal_id)
            .await?
            .ok_or(SignError::UnknownProposal { id: proposal_id })?;
        if proposal.expiry <= unix_now() {
            self.forget_proposal(&proposal).await?;
            let _ = self.events_tx.send(SignEvent::ProposalExpired { id: proposal_id });
            return Err(SignError::ProposalExpired { id: proposal_id });
        }
        ensure_conforms(&proposal.required_namespaces, &granted)?;

        let keypair = generate_keypair();
        let self_public_key = keypair.public_key.clone();
        let sym_key = derive_sym_key(&keypair.secret, &proposal.proposer_public_key)?;
        let session_topic = topic_from_key(&sym_key);
        self.keys.set_keypair(keypair).await?;
        self.keys.set_key(&session_topic, sym_key).await?;

        let expiry = unix_now() + SESSION_TTL;
        let session = Session {
            topic: session_topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            expiry,
            namespaces: granted.clone(),
            peer_metadata: proposal.proposer_metadata.clone(),
            self_public_key: self_public_key.clone(),
            peer_public_key: proposal.proposer_public_key.clone(),
            transport_type: TransportType::Relay,
        };

        let settled = self.settle(&proposal, &session, granted, expiry).await;
        if let Err(err) = settled {
            // Roll back so the proposal can still be answered.
            if let Err(unsub_err) = self.relay.unsubscribe(&session_topic).await {
                log::debug!(
                    "sign({}): rollback unsubscribe {session_topic} failed: {unsub_err}",
                    self.name
                );
            }
            self.keys.delete_key(&session_topic).await?;
            self.keys.delete_keypair(&self_public_key).await?;
            self.sessions.delete(&session_topic).await?;
            return Err(err);
        }

        self.proposals.delete(proposal_id).await?;
        self.pairings
            .activate(&proposal.pairing_topic, unix_now() + PAIRING_TTL_ACTIVE)
            .await?;
        let _ = self.events_tx.send(SignEvent::SessionSettled { session: session.clone() });
        log::info!("sign({}): session {session_topic} settled", self.name);
        Ok(session)
    }

    async fn settle(
        &self,
        proposal: &Proposal,
        session: &Session,
        granted: SessionNamespaces,
        expiry: i64,
    ) -> Result<(), SignError> {
        self.relay.subscribe(&session.topic).await?;
        self.sessions.insert(session.clone()).await?;

        let settle_params = SessionSettleParams {
            relay: RelayProtocol::irn(),
            controller: Participant {
                public_key: session.self_public_key.clone(),
                metadata: self.metadata.clone(),
            },
            namespaces: granted,
            session_properties: proposal.properties.clone(),
            scoped_properties: proposal.scoped_properties.clone(),
            expiry,
        };
        // Correlates the settle leg with the proposal it answers.
        self.publish_call_with(
            &session.topic,
            SignMethod::SessionSettle,
            serde_json::to_value(&settle_params)?,
            Some(proposal.request_id),
        )
        .await?;

        let response = SessionProposeResponse {
            relay: RelayProtocol::irn(),
            responder_public_key: session.self_public_key.clone(),
        };
        self.relay
            .publish_response(
                &proposal.pairing_topic,
                proposal.request_id,
                Ok(serde_json::to_value(&response)?),
                SignMethod::SessionPropose.response_tag(),
                SignMethod::SessionPropose.ttl(),
            )
            .await?;
        Ok(())
    }

    /// Decline a stored proposal with a peer-visible reason.
    pub async fn reject_session(
        &self,
        proposal_id: RequestId,
        reason: PeerError,
    ) -> Result<(), SignError> {
        let proposal = self
            .proposals
            .get(proposal_id)
            .await?
            .ok_or(SignError::UnknownProposal { id: proposal_id })?;
        self.relay
            .publish_response(
                &proposal.pairing_topic,
                proposal_id,
                Err(reason.into()),
                SignMethod::SessionPropose.response_tag(),
                SignMethod::SessionPropose.ttl(),
            )
            .await?;
        self.forget_proposal(&proposal).await?;
        Ok(())
    }

    // ── In-session traffic ────────────────────────────────────────────────────

    /// Invoke a namespace method on the peer. A registered wallet service
    /// claiming the method answers directly and nothing is published.
    pub async fn request(
        &self,
        topic: &Topic,
        chain_id: &str,
        method: &str,
        params: JsonValue,
        expiry: Option<i64>,
    ) -> Result<RequestId, SignError> {
        let session = self.active_session(topic).await?;
        if !method_authorized(&session.namespaces, chain_id, method) {
            return Err(SignError::unauthorized(format!("method {method} on {chain_id}")));
        }

        for service in &self.wallet_services {
            if service.handles(method) {
                let outcome = service.handle(topic, chain_id, method, &params).await;
                let id = generate_request_id();
                log::debug!(
                    "sign({}): request {id} ({method}) answered by wallet service",
                    self.name
                );
                let _ = self.events_tx.send(SignEvent::SessionResponse {
                    topic: topic.clone(),
                    id,
                    outcome,
                });
                return Ok(id);
            }
        }

        let body = SessionRequestParams {
            request: SessionRequestBody {
                method: method.to_owned(),
                params,
                expiry_timestamp: expiry,
            },
            chain_id: chain_id.to_owned(),
        };
        self.publish_call(topic, SignMethod::SessionRequest, serde_json::to_value(&body)?).await
    }

    /// Answer an inbound session request. Late answers to an expired request
    /// are refused and the peer is told the request expired.
    pub async fn respond(
        &self,
        topic: &Topic,
        id: RequestId,
        outcome: Result<JsonValue, PeerError>,
    ) -> Result<(), SignError> {
        self.active_session(topic).await?;
        let expiry = {
            let pending =
                self.pending_requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.get(&id).copied()
        };
        let expired = expiry.is_some_and(|expiry| expiry <= unix_now());

        let outcome = if expired {
            Err(PeerError::request_expired().into())
        } else {
            outcome.map_err(Into::into)
        };
        self.relay
            .publish_response(
                topic,
                id,
                outcome,
                SignMethod::SessionRequest.response_tag(),
                SignMethod::SessionRequest.ttl(),
            )
            .await?;
        {
            let mut pending =
                self.pending_requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.remove(&id);
        }
        if expired {
            return Err(SignError::Peer(PeerError::request_expired()));
        }
        Ok(())
    }

    /// Replace the negotiated namespaces. Propagated to the peer, then
    /// applied locally.
    pub async fn update(
        &self,
        topic: &Topic,
        namespaces: SessionNamespaces,
    ) -> Result<(), SignError> {
        let session = self.active_session(topic).await?;
        crate::namespaces::validate_session_namespaces(&namespaces)?;

        let params = SessionUpdateParams { namespaces: namespaces.clone() };
        self.publish_call(topic, SignMethod::SessionUpdate, serde_json::to_value(&params)?)
            .await?;
        self.sessions.update_namespaces(&session.topic, namespaces.clone()).await?;
        let _ = self
            .events_tx
            .send(SignEvent::SessionUpdated { topic: topic.clone(), namespaces });
        Ok(())
    }

    /// Push the session expiry out to a full lifetime from now.
    pub async fn extend(&self, topic: &Topic) -> Result<i64, SignError> {
        let session = self.active_session(topic).await?;
        let expiry = unix_now() + SESSION_TTL;
        self.publish_call(topic, SignMethod::SessionExtend, serde_json::json!({})).await?;
        self.sessions.update_expiry(&session.topic, expiry).await?;
        let _ = self.events_tx.send(SignEvent::SessionExtended { topic: topic.clone(), expiry });
        Ok(expiry)
    }

    /// Tear the session down on both sides.
    pub async fn disconnect(&self, topic: &Topic) -> Result<(), SignError> {
        self.sessions
            .get(topic)
            .await?
            .ok_or_else(|| SignError::UnknownSession { topic: topic.clone() })?;
        let params = SessionDeleteParams {
            code: USER_DISCONNECTED,
            message: "User disconnected".to_owned(),
        };
        self.publish_call(topic, SignMethod::SessionDelete, serde_json::to_value(&params)?)
            .await?;
        self.forget_session(topic).await?;
        let _ = self
            .events_tx
            .send(SignEvent::SessionDeleted { topic: topic.clone(), reason: None });
        Ok(())
    }

    /// Liveness probe. Works for sessions and pairings; the acknowledgement
    /// surfaces as [`SignEvent::SessionPingResponded`].
    pub async fn ping(&self, topic: &Topic) -> Result<(), SignError> {
        if self.sessions.get(topic).await?.is_some() {
            self.publish_call(topic, SignMethod::SessionPing, serde_json::json!({})).await?;
            return Ok(());
        }
        if self.pairings.get(topic).await?.is_some() {
            self.publish_call(topic, SignMethod::PairingPing, serde_json::json!({})).await?;
            return Ok(());
        }
        Err(SignError::UnknownSession { topic: topic.clone() })
    }

    /// Emit a namespace event to the peer.
    pub async fn emit(
        &self,
        topic: &Topic,
        chain_id: &str,
        name: &str,
        data: JsonValue,
    ) -> Result<RequestId, SignError> {
        let session = self.active_session(topic).await?;
        if !event_authorized(&session.namespaces, chain_id, name) {
            return Err(SignError::unauthorized(format!("event {name} on {chain_id}")));
        }
        let params = SessionEventParams {
            event: SessionEventBody { name: name.to_owned(), data },
            chain_id: chain_id.to_owned(),
        };
        self.publish_call(topic, SignMethod::SessionEvent, serde_json::to_value(&params)?).await
    }

    // ── One-shot authentication ───────────────────────────────────────────────

    /// Ask the peer on a pairing to authenticate with signed capabilities.
    pub async fn authenticate(
        &self,
        pairing_topic: &Topic,
        payload: AuthPayload,
    ) -> Result<RequestId, SignError> {
        if self.pairings.get(pairing_topic).await?.is_none() {
            return Err(SignError::UnknownPairing { topic: pairing_topic.clone() });
        }
        let keypair = generate_keypair();
        let public_key = keypair.public_key.clone();
        self.keys.set_keypair(keypair).await?;

        let params = SessionAuthenticateParams {
            requester: Participant {
                public_key: public_key.clone(),
                metadata: self.metadata.clone(),
            },
            auth_payload: payload,
            expiry_timestamp: unix_now() + AUTH_TTL,
        };
        let id = self
            .publish_call(
                pairing_topic,
                SignMethod::SessionAuthenticate,
                serde_json::to_value(&params)?,
            )
            .await?;
        {
            let mut own =
                self.own_auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            own.insert(
                id,
                OwnAuthRequest {
                    pairing_topic: pairing_topic.clone(),
                    self_public_key: public_key,
                },
            );
        }
        Ok(id)
    }

    /// Answer an authenticate request with signed capabilities. Every CACAO
    /// must verify; one bad signature fails the whole approval and nothing is
    /// published or stored.
    pub async fn approve_session_authenticate(
        &self,
        id: RequestId,
        cacaos: Vec<Cacao>,
    ) -> Result<Session, SignError> {
        let pending = {
            let requests =
                self.pending_auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            requests.get(&id).cloned()
        }
        .ok_or(SignError::UnknownAuthRequest { id })?;
        if pending.expiry <= unix_now() {
            return Err(SignError::Peer(PeerError::request_expired()));
        }
        if cacaos.is_empty() {
            return Err(SignError::invalid_namespaces("no signed capabilities"));
        }
        for cacao in &cacaos {
            self.verifier.verify(cacao)?;
        }

        let keypair = generate_keypair();
        let self_public_key = keypair.public_key.clone();
        let sym_key = derive_sym_key(&keypair.secret, &pending.requester.public_key)?;
        let session_topic = topic_from_key(&sym_key);
        self.keys.set_keypair(keypair).await?;
        self.keys.set_key(&session_topic, sym_key).await?;
        self.relay.subscribe(&session_topic).await?;

        let session = Session {
            topic: session_topic.clone(),
            pairing_topic: pending.topic.clone(),
            expiry: unix_now() + SESSION_TTL,
            namespaces: namespaces_from_cacaos(&cacaos),
            peer_metadata: pending.requester.metadata.clone(),
            self_public_key: self_public_key.clone(),
            peer_public_key: pending.requester.public_key.clone(),
            transport_type: TransportType::Relay,
        };
        self.sessions.insert(session.clone()).await?;

        let response = crate::protocol::SessionAuthenticateResponse {
            responder: Participant {
                public_key: self_public_key,
                metadata: self.metadata.clone(),
            },
            cacaos,
        };
        self.relay
            .publish_response(
                &pending.topic,
                id,
                Ok(serde_json::to_value(&response)?),
                SignMethod::SessionAuthenticate.response_tag(),
                SignMethod::SessionAuthenticate.ttl(),
            )
            .await?;
        {
            let mut requests =
                self.pending_auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            requests.remove(&id);
        }
        let _ = self.events_tx.send(SignEvent::SessionAuthenticated { session: session.clone() });
        log::info!("sign({}): authenticate {id} approved, session {session_topic}", self.name);
        Ok(session)
    }

    /// Decline an authenticate request.
    pub async fn reject_session_authenticate(&self, id: RequestId) -> Result<(), SignError> {
        let pending = {
            let mut requests =
                self.pending_auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            requests.remove(&id)
        }
        .ok_or(SignError::UnknownAuthRequest { id })?;
        self.relay
            .publish_response(
                &pending.topic,
                id,
                Err(PeerError::user_rejected().into()),
                SignMethod::SessionAuthenticate.response_tag(),
                SignMethod::SessionAuthenticate.ttl(),
            )
            .await?;
        Ok(())
    }

    /// Union of required and optional namespaces of a stored proposal, the
    /// widest grant an approver may build from.
    pub async fn merged_proposal_namespaces(
        &self,
        proposal_id: RequestId,
    ) -> Result<ProposalNamespaces, SignError> {
        let proposal = self
            .proposals
            .get(proposal_id)
            .await?
            .ok_or(SignError::UnknownProposal { id: proposal_id })?;
        let optional = proposal.optional_namespaces.clone().unwrap_or_default();
        Ok(merge_namespaces(&proposal.required_namespaces, &optional))
    }

    // ── Expiry ────────────────────────────────────────────────────────────────

    /// Prune everything past its expiry and report each casualty. Also runs
    /// periodically from the dispatcher.
    pub async fn sweep_expired(&self) -> Result<(), SignError> {
        let now = unix_now();

        for session in self.sessions.list().await? {
            if session.expiry <= now {
                self.forget_session(&session.topic).await?;
                let _ = self.events_tx.send(SignEvent::SessionExpired { topic: session.topic });
            }
        }
        for pairing in self.pairings.list().await? {
            if pairing.expiry <= now {
                self.forget_pairing(&pairing.topic).await?;
                let _ = self.events_tx.send(SignEvent::PairingExpired { topic: pairing.topic });
            }
        }
        for proposal in self.proposals.list().await? {
            if proposal.expiry <= now {
                self.forget_proposal(&proposal).await?;
                let _ =
                    self.events_tx.send(SignEvent::ProposalExpired { id: proposal.request_id });
            }
        }
        {
            let mut requests =
                self.pending_auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            requests.retain(|_, pending| pending.expiry > now);
        }
        Ok(())
    }

    // ── Shared plumbing ───────────────────────────────────────────────────────

    pub(crate) async fn active_session(&self, topic: &Topic) -> Result<Session, SignError> {
        let session = self
            .sessions
            .get(topic)
            .await?
            .ok_or_else(|| SignError::UnknownSession { topic: topic.clone() })?;
        if session.expiry <= unix_now() {
            return Err(SignError::SessionExpired { topic: topic.clone() });
        }
        Ok(session)
    }

    pub(crate) async fn publish_call(
        &self,
        topic: &Topic,
        method: SignMethod,
        params: JsonValue,
    ) -> Result<RequestId, SignError> {
        self.publish_call_with(topic, method, params, None).await
    }

    pub(crate) async fn publish_call_with(
        &self,
        topic: &Topic,
        method: SignMethod,
        params: JsonValue,
        correlation_id: Option<RequestId>,
    ) -> Result<RequestId, SignError> {
        let id = generate_request_id();
        self.relay
            .publish_request(tacit_relay::OutboundRequest {
                id,
                topic: topic.clone(),
                method: method.name().to_owned(),
                params,
                tag: method.request_tag(),
                ttl: method.ttl(),
                envelope: EnvelopeType::Type0,
                transport_type: TransportType::Relay,
                correlation_id,
            })
            .await?;
        Ok(id)
    }

    /// Drop all local state of a session. Relay-side unsubscribe is best
    /// effort; the key and record always go.
    pub(crate) async fn forget_session(&self, topic: &Topic) -> Result<(), SignError> {
        if let Err(err) = self.relay.unsubscribe(topic).await {
            log::debug!("sign({}): unsubscribe {topic} failed: {err}", self.name);
        }
        if let Some(session) = self.sessions.get(topic).await? {
            self.keys.delete_keypair(&session.self_public_key).await?;
        }
        self.keys.delete_key(topic).await?;
        self.sessions.delete(topic).await?;
        Ok(())
    }

    pub(crate) async fn forget_pairing(&self, topic: &Topic) -> Result<(), SignError> {
        if let Err(err) = self.relay.unsubscribe(topic).await {
            log::debug!("sign({}): unsubscribe {topic} failed: {err}", self.name);
        }
        self.keys.delete_key(topic).await?;
        self.pairings.delete(topic).await?;
        Ok(())
    }

    pub(crate) async fn forget_proposal(&self, proposal: &Proposal) -> Result<(), SignError> {
        // Only the proposer holds the keypair named by the proposal.
        self.keys.delete_keypair(&proposal.proposer_public_key).await?;
        self.proposals.delete(proposal.request_id).await?;
        Ok(())
    }
}

/// Session namespaces synthesized from authenticated capabilities: one
/// namespace per chain family, accounts taken from the CACAO issuers.
pub(crate) fn namespaces_from_cacaos(cacaos: &[Cacao]) -> SessionNamespaces {
    let mut namespaces = SessionNamespaces::new();
    for cacao in cacaos {
        let Some(account) = cacao.issuer_account() else { continue };
        let Some(chain) = cacao.issuer_chain() else { continue };
        let family = chain.split(':').next().unwrap_or(chain).to_owned();
        let namespace = namespaces.entry(family).or_default();
        if !namespace.chains.iter().any(|existing| existing == chain) {
            namespace.chains.push(chain.to_owned());
        }
        if !namespace.accounts.iter().any(|existing| existing == account) {
            namespace.accounts.push(account.to_owned());
        }
    }
    namespaces
}

impl Drop for SignClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SignClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignClient").field("name", &self.name).finish()
    }
}
