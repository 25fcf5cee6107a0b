use tacit_store::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum EnvelopeError {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("envelope too short for type {0}")]
    TooShort(u8),

    #[error("unknown envelope type {0}")]
    UnknownEnvelopeType(u8),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("no symmetric key for topic {topic}")]
    MissingKey { topic: String },

    #[error("key store: {0}")]
    Store(#[from] StoreError),
}
