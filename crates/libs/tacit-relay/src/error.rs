use tacit_envelope::EnvelopeError;
use tacit_store::StoreError;

use crate::rpc::RpcErrorBody;

/// Errors surfaced by relay calls.
///
/// `Timeout` is distinct from `JsonRpc` so callers can tell "never answered"
/// from "answered with an error".
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum RelayError {
    #[error("no internet connectivity")]
    NoConnectivity,

    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("relay error {code}: {message}")]
    JsonRpc { code: i64, message: String },

    #[error("unexpected result shape for {method}")]
    UnexpectedResult { method: String },

    #[error("no subscription recorded for topic {topic}")]
    NotSubscribed { topic: String },

    #[error("wire encoding: {message}")]
    Wire { message: String },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout { operation: operation.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn wire(message: impl Into<String>) -> Self {
        Self::Wire { message: message.into() }
    }
}

impl From<RpcErrorBody> for RelayError {
    fn from(error: RpcErrorBody) -> Self {
        Self::JsonRpc { code: error.code, message: error.message }
    }
}
