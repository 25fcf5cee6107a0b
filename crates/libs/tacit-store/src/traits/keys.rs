use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{StoredKeypair, SymKey, Topic};

/// Symmetric keys per topic plus client x25519 keypairs.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn set_key(&self, topic: &Topic, key: SymKey) -> Result<(), StoreError>;

    async fn key_for(&self, topic: &Topic) -> Result<Option<SymKey>, StoreError>;

    async fn delete_key(&self, topic: &Topic) -> Result<(), StoreError>;

    /// Store a client keypair under its hex public key.
    async fn set_keypair(&self, keypair: StoredKeypair) -> Result<(), StoreError>;

    async fn keypair_for(&self, public_key: &str) -> Result<Option<StoredKeypair>, StoreError>;

    async fn delete_keypair(&self, public_key: &str) -> Result<(), StoreError>;
}
