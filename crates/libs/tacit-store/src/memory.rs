//! In-memory repository implementations.
//!
//! Suitable for tests and short-lived clients; durable deployments plug in
//! their own backends behind the same traits.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::traits::{
    KeyStore, PairingRepository, ProposalRepository, RequestHistory, SessionRepository,
};
use crate::types::{
    Pairing, PendingRequestRecord, Proposal, RequestId, Session, SessionNamespaces, StoredKeypair,
    SymKey, Topic,
};

fn poisoned(what: &str) -> StoreError {
    StoreError::backend(format!("{what} lock poisoned"))
}

// ── Request history ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryHistory {
    records: RwLock<BTreeMap<RequestId, PendingRequestRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestHistory for InMemoryHistory {
    async fn set_request(&self, record: PendingRequestRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned("history"))?;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id, record);
        Ok(true)
    }

    async fn update_with_response(
        &self,
        id: RequestId,
        response: String,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned("history"))?;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("request {id}")))?;
        if record.response.is_some() {
            return Ok(false);
        }
        record.response = Some(response);
        Ok(true)
    }

    async fn get(&self, id: RequestId) -> Result<Option<PendingRequestRecord>, StoreError> {
        let records = self.records.read().map_err(|_| poisoned("history"))?;
        Ok(records.get(&id).cloned())
    }

    async fn exists(&self, id: RequestId) -> Result<bool, StoreError> {
        let records = self.records.read().map_err(|_| poisoned("history"))?;
        Ok(records.contains_key(&id))
    }

    async fn delete_by_topic(&self, topic: &Topic) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| poisoned("history"))?;
        records.retain(|_, record| record.topic != *topic);
        Ok(())
    }
}

// ── Key store ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<BTreeMap<Topic, SymKey>>,
    keypairs: RwLock<BTreeMap<String, StoredKeypair>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn set_key(&self, topic: &Topic, key: SymKey) -> Result<(), StoreError> {
        let mut keys = self.keys.write().map_err(|_| poisoned("keys"))?;
        keys.insert(topic.clone(), key);
        Ok(())
    }

    async fn key_for(&self, topic: &Topic) -> Result<Option<SymKey>, StoreError> {
        let keys = self.keys.read().map_err(|_| poisoned("keys"))?;
        Ok(keys.get(topic).cloned())
    }

    async fn delete_key(&self, topic: &Topic) -> Result<(), StoreError> {
        let mut keys = self.keys.write().map_err(|_| poisoned("keys"))?;
        keys.remove(topic);
        Ok(())
    }

    async fn set_keypair(&self, keypair: StoredKeypair) -> Result<(), StoreError> {
        let mut keypairs = self.keypairs.write().map_err(|_| poisoned("keypairs"))?;
        keypairs.insert(keypair.public_key.clone(), keypair);
        Ok(())
    }

    async fn keypair_for(&self, public_key: &str) -> Result<Option<StoredKeypair>, StoreError> {
        let keypairs = self.keypairs.read().map_err(|_| poisoned("keypairs"))?;
        Ok(keypairs.get(public_key).cloned())
    }

    async fn delete_keypair(&self, public_key: &str) -> Result<(), StoreError> {
        let mut keypairs = self.keypairs.write().map_err(|_| poisoned("keypairs"))?;
        keypairs.remove(public_key);
        Ok(())
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySessions {
    sessions: RwLock<BTreeMap<Topic, Session>>,
}

impl InMemorySessions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessions {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("sessions"))?;
        sessions.insert(session.topic.clone(), session);
        Ok(())
    }

    async fn get(&self, topic: &Topic) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.read().map_err(|_| poisoned("sessions"))?;
        Ok(sessions.get(topic).cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let sessions = self.sessions.read().map_err(|_| poisoned("sessions"))?;
        Ok(sessions.values().cloned().collect())
    }

    async fn delete(&self, topic: &Topic) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("sessions"))?;
        sessions.remove(topic);
        Ok(())
    }

    async fn update_namespaces(
        &self,
        topic: &Topic,
        namespaces: SessionNamespaces,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("sessions"))?;
        let session = sessions
            .get_mut(topic)
            .ok_or_else(|| StoreError::not_found(format!("session {topic}")))?;
        session.namespaces = namespaces;
        Ok(())
    }

    async fn update_expiry(&self, topic: &Topic, expiry: i64) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("sessions"))?;
        let session = sessions
            .get_mut(topic)
            .ok_or_else(|| StoreError::not_found(format!("session {topic}")))?;
        session.expiry = expiry;
        Ok(())
    }
}

// ── Proposals ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryProposals {
    proposals: RwLock<BTreeMap<RequestId, Proposal>>,
}

impl InMemoryProposals {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProposalRepository for InMemoryProposals {
    async fn insert(&self, proposal: Proposal) -> Result<(), StoreError> {
        let mut proposals = self.proposals.write().map_err(|_| poisoned("proposals"))?;
        proposals.insert(proposal.request_id, proposal);
        Ok(())
    }

    async fn get(&self, request_id: RequestId) -> Result<Option<Proposal>, StoreError> {
        let proposals = self.proposals.read().map_err(|_| poisoned("proposals"))?;
        Ok(proposals.get(&request_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Proposal>, StoreError> {
        let proposals = self.proposals.read().map_err(|_| poisoned("proposals"))?;
        Ok(proposals.values().cloned().collect())
    }

    async fn delete(&self, request_id: RequestId) -> Result<(), StoreError> {
        let mut proposals = self.proposals.write().map_err(|_| poisoned("proposals"))?;
        proposals.remove(&request_id);
        Ok(())
    }
}

// ── Pairings ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryPairings {
    pairings: RwLock<BTreeMap<Topic, Pairing>>,
}

impl InMemoryPairings {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PairingRepository for InMemoryPairings {
    async fn insert(&self, pairing: Pairing) -> Result<(), StoreError> {
        let mut pairings = self.pairings.write().map_err(|_| poisoned("pairings"))?;
        pairings.insert(pairing.topic.clone(), pairing);
        Ok(())
    }

    async fn get(&self, topic: &Topic) -> Result<Option<Pairing>, StoreError> {
        let pairings = self.pairings.read().map_err(|_| poisoned("pairings"))?;
        Ok(pairings.get(topic).cloned())
    }

    async fn list(&self) -> Result<Vec<Pairing>, StoreError> {
        let pairings = self.pairings.read().map_err(|_| poisoned("pairings"))?;
        Ok(pairings.values().cloned().collect())
    }

    async fn delete(&self, topic: &Topic) -> Result<(), StoreError> {
        let mut pairings = self.pairings.write().map_err(|_| poisoned("pairings"))?;
        pairings.remove(topic);
        Ok(())
    }

    async fn activate(&self, topic: &Topic, expiry: i64) -> Result<(), StoreError> {
        let mut pairings = self.pairings.write().map_err(|_| poisoned("pairings"))?;
        let pairing = pairings
            .get_mut(topic)
            .ok_or_else(|| StoreError::not_found(format!("pairing {topic}")))?;
        pairing.active = true;
        pairing.expiry = expiry;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportType;

    fn record(id: RequestId, topic: &Topic) -> PendingRequestRecord {
        PendingRequestRecord {
            id,
            topic: topic.clone(),
            method: "wc_sessionRequest".to_owned(),
            body: "{}".to_owned(),
            transport_type: TransportType::Relay,
            response: None,
        }
    }

    #[tokio::test]
    async fn set_request_rejects_duplicate_ids() {
        let history = InMemoryHistory::new();
        let topic = Topic::generate();
        assert!(history.set_request(record(1, &topic)).await.expect("insert"));
        assert!(!history.set_request(record(1, &topic)).await.expect("duplicate insert"));
        assert!(history.exists(1).await.expect("exists"));
    }

    #[tokio::test]
    async fn response_update_is_idempotent() {
        let history = InMemoryHistory::new();
        let topic = Topic::generate();
        history.set_request(record(7, &topic)).await.expect("insert");
        assert!(history.update_with_response(7, "ok".to_owned()).await.expect("first"));
        assert!(!history.update_with_response(7, "again".to_owned()).await.expect("second"));
        let stored = history.get(7).await.expect("get").expect("present");
        assert_eq!(stored.response.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn update_without_record_is_not_found() {
        let history = InMemoryHistory::new();
        let err = history.update_with_response(9, "ok".to_owned()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_by_topic_prunes_only_that_topic() {
        let history = InMemoryHistory::new();
        let kept = Topic::generate();
        let dropped = Topic::generate();
        history.set_request(record(1, &kept)).await.expect("insert");
        history.set_request(record(2, &dropped)).await.expect("insert");
        history.delete_by_topic(&dropped).await.expect("delete");
        assert!(history.exists(1).await.expect("exists"));
        assert!(!history.exists(2).await.expect("exists"));
    }
}
