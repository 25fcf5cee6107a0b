//! Inbound dispatch: every decrypted peer request and correlated response
//! lands here, gets validated against local state, and is answered or
//! surfaced as a [`SignEvent`].

use serde_json::json;

use tacit_envelope::{derive_sym_key, topic_from_key};
use tacit_relay::{InboundRequest, InboundResponse, RpcErrorBody};
use tacit_store::{RequestId, Session, Topic, TransportType};

use crate::client::{namespaces_from_cacaos, PendingAuthRequest, PendingSettlement, SignClient};
use crate::error::{code, PeerError};
use crate::events::SignEvent;
use crate::namespaces::{event_authorized, method_authorized, validate_session_namespaces};
use crate::protocol::{
    unix_now, SessionAuthenticateParams, SessionAuthenticateResponse, SessionDeleteParams,
    SessionEventParams, SessionProposeParams, SessionProposeResponse, SessionRequestParams,
    SessionSettleParams, SessionUpdateParams, SignCall, SignMethod, PAIRING_TTL_ACTIVE,
    PROPOSAL_TTL, SESSION_TTL,
};

impl SignClient {
    pub(crate) async fn handle_request(&self, request: InboundRequest) {
        let Some(method) = SignMethod::from_name(&request.method) else {
            log::debug!("sign({}): unsupported method {}", self.name, request.method);
            // No tag of its own; the ping response tag is the neutral choice.
            self.answer_err(
                &request.topic,
                request.id,
                SignMethod::SessionPing,
                PeerError::new(code::INVALID_METHOD, format!("unsupported: {}", request.method)),
            )
            .await;
            return;
        };

        let call = match SignCall::decode(method, request.params) {
            Ok(call) => call,
            Err(err) => {
                log::debug!("sign({}): {err}", self.name);
                let error_code = match method {
                    SignMethod::SessionUpdate => code::INVALID_UPDATE_REQUEST,
                    SignMethod::SessionExtend => code::INVALID_EXTEND_REQUEST,
                    SignMethod::SessionEvent => code::INVALID_EVENT,
                    _ => code::INVALID_METHOD,
                };
                self.answer_err(
                    &request.topic,
                    request.id,
                    method,
                    PeerError::new(error_code, err.to_string()),
                )
                .await;
                return;
            }
        };

        let topic = request.topic;
        let id = request.id;
        match call {
            SignCall::SessionPropose(params) => self.on_session_propose(topic, id, params).await,
            SignCall::SessionSettle(params) => self.on_session_settle(topic, id, params).await,
            SignCall::SessionRequest(params) => self.on_session_request(topic, id, params).await,
            SignCall::SessionUpdate(params) => self.on_session_update(topic, id, params).await,
            SignCall::SessionExtend(_) => self.on_session_extend(topic, id).await,
            SignCall::SessionDelete(params) => self.on_session_delete(topic, id, params).await,
            SignCall::SessionPing => {
                self.answer_ok(&topic, id, SignMethod::SessionPing).await;
            }
            SignCall::SessionEvent(params) => self.on_session_event(topic, id, params).await,
            SignCall::SessionAuthenticate(params) => {
                self.on_session_authenticate(topic, id, params).await;
            }
            SignCall::PairingPing => {
                self.answer_ok(&topic, id, SignMethod::PairingPing).await;
            }
            SignCall::PairingDelete(_) => self.on_pairing_delete(topic, id).await,
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    async fn on_session_propose(
        &self,
        topic: Topic,
        id: RequestId,
        params: SessionProposeParams,
    ) {
        match self.pairings.get(&topic).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                log::debug!("sign({}): proposal over unknown pairing {topic}", self.name);
                return;
            }
            Err(err) => {
                log::warn!("sign({}): pairing lookup failed: {err}", self.name);
                return;
            }
        }
        if let Err(err) =
            crate::namespaces::validate_proposal_namespaces(&params.required_namespaces)
        {
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionPropose,
                PeerError::new(code::UNSUPPORTED_NAMESPACE_KEY, err.to_string()),
            )
            .await;
            return;
        }

        let expiry = params.expiry_timestamp.min(unix_now() + PROPOSAL_TTL);
        if expiry <= unix_now() {
            self.answer_err(&topic, id, SignMethod::SessionPropose, PeerError::request_expired())
                .await;
            return;
        }

        let proposal = tacit_store::Proposal {
            request_id: id,
            pairing_topic: topic,
            proposer_public_key: params.proposer.public_key,
            proposer_metadata: params.proposer.metadata,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
            properties: params.session_properties,
            scoped_properties: params.scoped_properties,
            expiry,
        };
        if let Err(err) = self.proposals.insert(proposal.clone()).await {
            log::warn!("sign({}): storing proposal {id} failed: {err}", self.name);
            return;
        }
        let _ = self.events_tx.send(SignEvent::SessionProposal { proposal });
    }

    /// The responder settled; we are the proposer and prepared this topic
    /// when the approval response arrived.
    async fn on_session_settle(&self, topic: Topic, id: RequestId, params: SessionSettleParams) {
        let pending = {
            let settlements =
                self.pending_settlements.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            settlements.get(&topic).cloned()
        };
        let Some(pending) = pending else {
            log::debug!("sign({}): settle on unexpected topic {topic}", self.name);
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionSettle,
                PeerError::new(code::SESSION_SETTLEMENT_FAILED, "no pending settlement"),
            )
            .await;
            return;
        };

        if let Err(err) = validate_session_namespaces(&params.namespaces) {
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionSettle,
                PeerError::new(code::SESSION_SETTLEMENT_FAILED, err.to_string()),
            )
            .await;
            return;
        }

        let session = Session {
            topic: topic.clone(),
            pairing_topic: pending.pairing_topic.clone(),
            expiry: params.expiry.min(unix_now() + SESSION_TTL),
            namespaces: params.namespaces,
            peer_metadata: params.controller.metadata,
            self_public_key: pending.self_public_key,
            peer_public_key: params.controller.public_key,
            transport_type: TransportType::Relay,
        };
        if let Err(err) = self.sessions.insert(session.clone()).await {
            log::warn!("sign({}): storing session {topic} failed: {err}", self.name);
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionSettle,
                PeerError::new(code::SESSION_SETTLEMENT_FAILED, err.to_string()),
            )
            .await;
            return;
        }

        self.answer_ok(&topic, id, SignMethod::SessionSettle).await;
        {
            let mut settlements =
                self.pending_settlements.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            settlements.remove(&topic);
        }
        if let Err(err) = self.proposals.delete(pending.proposal_id).await {
            log::warn!("sign({}): pruning proposal failed: {err}", self.name);
        }
        if let Err(err) =
            self.pairings.activate(&pending.pairing_topic, unix_now() + PAIRING_TTL_ACTIVE).await
        {
            log::debug!("sign({}): pairing activate failed: {err}", self.name);
        }
        log::info!("sign({}): session {topic} settled by peer", self.name);
        let _ = self.events_tx.send(SignEvent::SessionSettled { session });
    }

    async fn on_session_request(
        &self,
        topic: Topic,
        id: RequestId,
        params: SessionRequestParams,
    ) {
        let session = match self.sessions.get(&topic).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                log::debug!("sign({}): request on unknown topic {topic}", self.name);
                return;
            }
            Err(err) => {
                log::warn!("sign({}): session lookup failed: {err}", self.name);
                return;
            }
        };
        if session.expiry <= unix_now() {
            self.answer_err(&topic, id, SignMethod::SessionRequest, PeerError::request_expired())
                .await;
            return;
        }
        if let Some(expiry) = params.request.expiry_timestamp {
            if expiry <= unix_now() {
                self.answer_err(
                    &topic,
                    id,
                    SignMethod::SessionRequest,
                    PeerError::request_expired(),
                )
                .await;
                return;
            }
        }
        if !method_authorized(&session.namespaces, &params.chain_id, &params.request.method) {
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionRequest,
                PeerError::new(
                    code::UNAUTHORIZED_METHOD,
                    format!("{} not authorized on {}", params.request.method, params.chain_id),
                ),
            )
            .await;
            return;
        }

        {
            let mut pending =
                self.pending_requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.insert(id, params.request.expiry_timestamp.unwrap_or(i64::MAX));
        }
        let _ = self.events_tx.send(SignEvent::SessionRequest {
            topic,
            id,
            chain_id: params.chain_id,
            method: params.request.method,
            params: params.request.params,
        });
    }

    async fn on_session_update(&self, topic: Topic, id: RequestId, params: SessionUpdateParams) {
        if self.sessions.get(&topic).await.ok().flatten().is_none() {
            log::debug!("sign({}): update on unknown topic {topic}", self.name);
            return;
        }
        if let Err(err) = validate_session_namespaces(&params.namespaces) {
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionUpdate,
                PeerError::new(code::INVALID_UPDATE_REQUEST, err.to_string()),
            )
            .await;
            return;
        }
        if let Err(err) = self.sessions.update_namespaces(&topic, params.namespaces.clone()).await
        {
            log::warn!("sign({}): applying update failed: {err}", self.name);
            return;
        }
        self.answer_ok(&topic, id, SignMethod::SessionUpdate).await;
        let _ = self
            .events_tx
            .send(SignEvent::SessionUpdated { topic, namespaces: params.namespaces });
    }

    async fn on_session_extend(&self, topic: Topic, id: RequestId) {
        if self.sessions.get(&topic).await.ok().flatten().is_none() {
            log::debug!("sign({}): extend on unknown topic {topic}", self.name);
            return;
        }
        let expiry = unix_now() + SESSION_TTL;
        if let Err(err) = self.sessions.update_expiry(&topic, expiry).await {
            log::warn!("sign({}): applying extend failed: {err}", self.name);
            return;
        }
        self.answer_ok(&topic, id, SignMethod::SessionExtend).await;
        let _ = self.events_tx.send(SignEvent::SessionExtended { topic, expiry });
    }

    async fn on_session_delete(&self, topic: Topic, id: RequestId, params: SessionDeleteParams) {
        // Acknowledge first; the unsubscribe below tears the channel down.
        self.answer_ok(&topic, id, SignMethod::SessionDelete).await;
        if let Err(err) = self.forget_session(&topic).await {
            log::warn!("sign({}): session teardown failed: {err}", self.name);
        }
        let _ = self.events_tx.send(SignEvent::SessionDeleted {
            topic,
            reason: Some(PeerError::new(params.code, params.message)),
        });
    }

    async fn on_session_event(&self, topic: Topic, id: RequestId, params: SessionEventParams) {
        let session = match self.sessions.get(&topic).await {
            Ok(Some(session)) => session,
            _ => {
                log::debug!("sign({}): event on unknown topic {topic}", self.name);
                return;
            }
        };
        if !event_authorized(&session.namespaces, &params.chain_id, &params.event.name) {
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionEvent,
                PeerError::new(
                    code::UNAUTHORIZED_EVENT,
                    format!("{} not authorized on {}", params.event.name, params.chain_id),
                ),
            )
            .await;
            return;
        }
        self.answer_ok(&topic, id, SignMethod::SessionEvent).await;
        let _ = self.events_tx.send(SignEvent::SessionEvent {
            topic,
            chain_id: params.chain_id,
            name: params.event.name,
            data: params.event.data,
        });
    }

    async fn on_pairing_delete(&self, topic: Topic, id: RequestId) {
        self.answer_ok(&topic, id, SignMethod::PairingDelete).await;
        if let Err(err) = self.forget_pairing(&topic).await {
            log::warn!("sign({}): pairing teardown failed: {err}", self.name);
        }
        let _ = self.events_tx.send(SignEvent::PairingDeleted { topic });
    }

    async fn on_session_authenticate(
        &self,
        topic: Topic,
        id: RequestId,
        params: SessionAuthenticateParams,
    ) {
        if params.expiry_timestamp <= unix_now() {
            self.answer_err(
                &topic,
                id,
                SignMethod::SessionAuthenticate,
                PeerError::request_expired(),
            )
            .await;
            return;
        }
        {
            let mut requests =
                self.pending_auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            requests.insert(
                id,
                PendingAuthRequest {
                    topic: topic.clone(),
                    requester: params.requester.clone(),
                    payload: params.auth_payload.clone(),
                    expiry: params.expiry_timestamp,
                },
            );
        }
        let _ = self.events_tx.send(SignEvent::SessionAuthenticateRequest {
            id,
            topic,
            requester: params.requester,
            payload: params.auth_payload,
        });
    }

    // ── Responses ─────────────────────────────────────────────────────────────

    pub(crate) async fn handle_response(&self, response: InboundResponse) {
        match response.method.as_str() {
            // The relay-level approve escape hatch carries the same result
            // shape as a proposal approval.
            "wc_sessionPropose" | "wc_approveSession" => {
                self.on_propose_response(response).await;
            }
            "wc_sessionSettle" => self.on_settle_response(response).await,
            "wc_sessionRequest" => {
                let _ = self.events_tx.send(SignEvent::SessionResponse {
                    topic: response.topic,
                    id: response.id,
                    outcome: response.outcome.map_err(PeerError::from),
                });
            }
            "wc_sessionPing" | "wc_pairingPing" => {
                let _ = self
                    .events_tx
                    .send(SignEvent::SessionPingResponded { topic: response.topic });
            }
            "wc_sessionAuthenticate" => self.on_authenticate_response(response).await,
            _ => {
                log::debug!(
                    "sign({}): ack for {} ({}) ignored",
                    self.name,
                    response.method,
                    response.id
                );
            }
        }
    }

    /// Proposer side: the responder approved or rejected our proposal.
    async fn on_propose_response(&self, response: InboundResponse) {
        let proposal = match self.proposals.get(response.id).await {
            Ok(Some(proposal)) => proposal,
            Ok(None) => {
                log::debug!("sign({}): approval for unknown proposal {}", self.name, response.id);
                return;
            }
            Err(err) => {
                log::warn!("sign({}): proposal lookup failed: {err}", self.name);
                return;
            }
        };

        let body = match response.outcome {
            Ok(body) => body,
            Err(error) => {
                let reason = PeerError::from(error);
                if let Err(err) = self.forget_proposal(&proposal).await {
                    log::warn!("sign({}): pruning rejected proposal failed: {err}", self.name);
                }
                let _ = self
                    .events_tx
                    .send(SignEvent::SessionRejected { id: response.id, reason });
                return;
            }
        };
        let approved: SessionProposeResponse = match serde_json::from_value(body) {
            Ok(approved) => approved,
            Err(err) => {
                log::warn!("sign({}): malformed approval for {}: {err}", self.name, response.id);
                return;
            }
        };

        let keypair = match self.keys.keypair_for(&proposal.proposer_public_key).await {
            Ok(Some(keypair)) => keypair,
            _ => {
                log::warn!(
                    "sign({}): no keypair for proposal {}, cannot derive session",
                    self.name,
                    response.id
                );
                return;
            }
        };
        let sym_key = match derive_sym_key(&keypair.secret, &approved.responder_public_key) {
            Ok(sym_key) => sym_key,
            Err(err) => {
                log::warn!("sign({}): key agreement failed for {}: {err}", self.name, response.id);
                return;
            }
        };
        let session_topic = topic_from_key(&sym_key);
        if let Err(err) = self.keys.set_key(&session_topic, sym_key).await {
            log::warn!("sign({}): storing session key failed: {err}", self.name);
            return;
        }
        {
            let mut settlements =
                self.pending_settlements.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            settlements.insert(
                session_topic.clone(),
                PendingSettlement {
                    proposal_id: response.id,
                    pairing_topic: proposal.pairing_topic.clone(),
                    self_public_key: proposal.proposer_public_key.clone(),
                },
            );
        }
        // The settle call is usually already retained on this topic and is
        // delivered right after the subscription acknowledges.
        if let Err(err) = self.relay.subscribe(&session_topic).await {
            log::warn!("sign({}): subscribing session topic failed: {err}", self.name);
        }
    }

    /// Responder side: the proposer acknowledged or refused our settle call.
    async fn on_settle_response(&self, response: InboundResponse) {
        if let Err(error) = response.outcome {
            let reason = PeerError::from(error);
            log::warn!(
                "sign({}): settle refused on {}: {reason}",
                self.name,
                response.topic
            );
            if let Err(err) = self.forget_session(&response.topic).await {
                log::warn!("sign({}): settle rollback failed: {err}", self.name);
            }
            let _ = self.events_tx.send(SignEvent::SessionDeleted {
                topic: response.topic,
                reason: Some(reason),
            });
        }
    }

    /// Originator side: the responder approved or rejected authentication.
    async fn on_authenticate_response(&self, response: InboundResponse) {
        let own = {
            let mut requests =
                self.own_auth.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            requests.remove(&response.id)
        };
        let Some(own) = own else {
            log::debug!("sign({}): authenticate ack for unknown id {}", self.name, response.id);
            return;
        };

        let body = match response.outcome {
            Ok(body) => body,
            Err(error) => {
                if let Err(err) = self.keys.delete_keypair(&own.self_public_key).await {
                    log::debug!("sign({}): pruning auth keypair failed: {err}", self.name);
                }
                let _ = self.events_tx.send(SignEvent::SessionAuthenticateRejected {
                    id: response.id,
                    reason: PeerError::from(error),
                });
                return;
            }
        };
        let approved: SessionAuthenticateResponse = match serde_json::from_value(body) {
            Ok(approved) => approved,
            Err(err) => {
                log::warn!(
                    "sign({}): malformed authenticate response for {}: {err}",
                    self.name,
                    response.id
                );
                return;
            }
        };

        // Same all-or-nothing rule as approval: one bad signature voids the
        // whole response.
        for cacao in &approved.cacaos {
            if let Err(err) = self.verifier.verify(cacao) {
                log::warn!("sign({}): authenticate response dropped: {err}", self.name);
                return;
            }
        }
        let namespaces = namespaces_from_cacaos(&approved.cacaos);
        if namespaces.is_empty() {
            log::warn!(
                "sign({}): authenticate response for {} carries no accounts",
                self.name,
                response.id
            );
            return;
        }

        let keypair = match self.keys.keypair_for(&own.self_public_key).await {
            Ok(Some(keypair)) => keypair,
            _ => {
                log::warn!("sign({}): no keypair for authenticate {}", self.name, response.id);
                return;
            }
        };
        let sym_key = match derive_sym_key(&keypair.secret, &approved.responder.public_key) {
            Ok(sym_key) => sym_key,
            Err(err) => {
                log::warn!("sign({}): key agreement failed for {}: {err}", self.name, response.id);
                return;
            }
        };
        let session_topic = topic_from_key(&sym_key);
        if let Err(err) = self.keys.set_key(&session_topic, sym_key).await {
            log::warn!("sign({}): storing session key failed: {err}", self.name);
            return;
        }
        if let Err(err) = self.relay.subscribe(&session_topic).await {
            log::warn!("sign({}): subscribing session topic failed: {err}", self.name);
        }

        let session = Session {
            topic: session_topic,
            pairing_topic: own.pairing_topic,
            expiry: unix_now() + SESSION_TTL,
            namespaces,
            peer_metadata: approved.responder.metadata,
            self_public_key: own.self_public_key,
            peer_public_key: approved.responder.public_key,
            transport_type: TransportType::Relay,
        };
        if let Err(err) = self.sessions.insert(session.clone()).await {
            log::warn!("sign({}): storing session failed: {err}", self.name);
            return;
        }
        let _ = self.events_tx.send(SignEvent::SessionAuthenticated { session });
    }

    // ── Answer helpers ────────────────────────────────────────────────────────

    async fn answer_ok(&self, topic: &Topic, id: RequestId, method: SignMethod) {
        if let Err(err) = self
            .relay
            .publish_response(topic, id, Ok(json!(true)), method.response_tag(), method.ttl())
            .await
        {
            log::warn!("sign({}): answering {id} failed: {err}", self.name);
        }
    }

    async fn answer_err(&self, topic: &Topic, id: RequestId, method: SignMethod, error: PeerError) {
        if let Err(err) = self
            .relay
            .publish_response(
                topic,
                id,
                Err(RpcErrorBody::from(error)),
                method.response_tag(),
                method.ttl(),
            )
            .await
        {
            log::warn!("sign({}): answering {id} failed: {err}", self.name);
        }
    }
}
