use std::sync::Arc;

use async_trait::async_trait;

use tacit_store::{KeyStore, Topic};

use crate::envelope::{open_envelope, seal_envelope, DecodedEnvelope, EnvelopeType};
use crate::error::EnvelopeError;

/// Per-topic encrypt/decrypt, the only crypto surface the relay layer sees.
#[async_trait]
pub trait Codec: Send + Sync {
    async fn encrypt(
        &self,
        topic: &Topic,
        plaintext: &str,
        envelope: &EnvelopeType,
    ) -> Result<String, EnvelopeError>;

    async fn decrypt(&self, topic: &Topic, message: &str) -> Result<DecodedEnvelope, EnvelopeError>;
}

/// [`Codec`] backed by a [`KeyStore`]: the topic's symmetric key must have
/// been stored before any message for that topic can be sealed or opened.
pub struct KeyedCodec {
    keys: Arc<dyn KeyStore>,
}

impl KeyedCodec {
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Codec for KeyedCodec {
    async fn encrypt(
        &self,
        topic: &Topic,
        plaintext: &str,
        envelope: &EnvelopeType,
    ) -> Result<String, EnvelopeError> {
        let key = self
            .keys
            .key_for(topic)
            .await?
            .ok_or_else(|| EnvelopeError::MissingKey { topic: topic.to_string() })?;
        seal_envelope(&key, plaintext, envelope)
    }

    async fn decrypt(
        &self,
        topic: &Topic,
        message: &str,
    ) -> Result<DecodedEnvelope, EnvelopeError> {
        let key = self
            .keys
            .key_for(topic)
            .await?
            .ok_or_else(|| EnvelopeError::MissingKey { topic: topic.to_string() })?;
        open_envelope(&key, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tacit_store::{InMemoryKeyStore, SymKey};

    #[tokio::test]
    async fn keyed_codec_roundtrips_with_stored_key() {
        let keys = Arc::new(InMemoryKeyStore::new());
        let topic = Topic::generate();
        keys.set_key(&topic, SymKey([3u8; 32])).await.expect("set key");

        let codec = KeyedCodec::new(keys);
        let sealed = codec.encrypt(&topic, "payload", &EnvelopeType::Type0).await.expect("seal");
        let opened = codec.decrypt(&topic, &sealed).await.expect("open");
        assert_eq!(opened.plaintext, "payload");
    }

    #[tokio::test]
    async fn missing_key_is_reported_per_topic() {
        let codec = KeyedCodec::new(Arc::new(InMemoryKeyStore::new()));
        let topic = Topic::generate();
        let err = codec.encrypt(&topic, "payload", &EnvelopeType::Type0).await.unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingKey { .. }));
    }
}
