use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Pairing, Proposal, RequestId, Session, SessionNamespaces, Topic};

/// Established sessions, keyed by session topic.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert or replace the session for its topic.
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    async fn get(&self, topic: &Topic) -> Result<Option<Session>, StoreError>;

    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    async fn delete(&self, topic: &Topic) -> Result<(), StoreError>;

    /// Replace the negotiated namespace map. Unknown topics are `NotFound`.
    async fn update_namespaces(
        &self,
        topic: &Topic,
        namespaces: SessionNamespaces,
    ) -> Result<(), StoreError>;

    /// Replace the expiry. Unknown topics are `NotFound`.
    async fn update_expiry(&self, topic: &Topic, expiry: i64) -> Result<(), StoreError>;
}

/// Session proposals in flight, sent or received, keyed by the propose
/// request id.
#[async_trait]
pub trait ProposalRepository: Send + Sync {
    async fn insert(&self, proposal: Proposal) -> Result<(), StoreError>;

    async fn get(&self, request_id: RequestId) -> Result<Option<Proposal>, StoreError>;

    async fn list(&self) -> Result<Vec<Proposal>, StoreError>;

    async fn delete(&self, request_id: RequestId) -> Result<(), StoreError>;
}

/// Bootstrap pairings, keyed by pairing topic.
#[async_trait]
pub trait PairingRepository: Send + Sync {
    async fn insert(&self, pairing: Pairing) -> Result<(), StoreError>;

    async fn get(&self, topic: &Topic) -> Result<Option<Pairing>, StoreError>;

    async fn list(&self) -> Result<Vec<Pairing>, StoreError>;

    async fn delete(&self, topic: &Topic) -> Result<(), StoreError>;

    /// Mark the pairing active (a session was negotiated over it) and move
    /// its expiry to the longer active lifetime.
    async fn activate(&self, topic: &Topic, expiry: i64) -> Result<(), StoreError>;
}
