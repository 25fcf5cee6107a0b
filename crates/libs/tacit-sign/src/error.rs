use tacit_envelope::EnvelopeError;
use tacit_relay::{RelayError, RpcErrorBody};
use tacit_store::{RequestId, StoreError, Topic};
use thiserror::Error;

/// Protocol error codes carried in peer-visible error responses.
///
/// These are part of the wire contract: a peer that receives one of these
/// codes is expected to react to the number, not the message text.
pub mod code {
    /// Caller invoked a method the session namespaces do not list.
    pub const INVALID_METHOD: i64 = 1001;
    /// Event name is not listed in the session namespaces.
    pub const INVALID_EVENT: i64 = 1002;
    /// Update request carried a malformed or non-conforming namespace map.
    pub const INVALID_UPDATE_REQUEST: i64 = 1004;
    /// Extend request asked for an expiry outside the allowed window.
    pub const INVALID_EXTEND_REQUEST: i64 = 1005;

    /// Method is valid but the sender is not authorized for it.
    pub const UNAUTHORIZED_METHOD: i64 = 3001;
    /// Event is valid but the sender is not authorized to emit it.
    pub const UNAUTHORIZED_EVENT: i64 = 3002;
    /// Update came from a peer that does not control the session.
    pub const UNAUTHORIZED_UPDATE_REQUEST: i64 = 3004;
    /// Extend came from a peer that does not control the session.
    pub const UNAUTHORIZED_EXTEND_REQUEST: i64 = 3005;

    /// The user declined the proposal or request.
    pub const USER_REJECTED: i64 = 5000;
    /// The user declined the requested chains.
    pub const USER_REJECTED_CHAINS: i64 = 5001;
    /// The user declined the requested methods.
    pub const USER_REJECTED_METHODS: i64 = 5002;
    /// The user declined the requested events.
    pub const USER_REJECTED_EVENTS: i64 = 5003;

    /// Peer does not support one of the requested chains.
    pub const UNSUPPORTED_CHAINS: i64 = 5100;
    /// Peer does not support one of the requested methods.
    pub const UNSUPPORTED_METHODS: i64 = 5101;
    /// Peer does not support one of the requested events.
    pub const UNSUPPORTED_EVENTS: i64 = 5102;
    /// Peer does not support one of the requested accounts.
    pub const UNSUPPORTED_ACCOUNTS: i64 = 5103;
    /// Peer does not support one of the requested namespace keys.
    pub const UNSUPPORTED_NAMESPACE_KEY: i64 = 5104;

    /// Session settlement failed after approval.
    pub const SESSION_SETTLEMENT_FAILED: i64 = 7000;

    /// The request expired before it was answered.
    pub const SESSION_REQUEST_EXPIRED: i64 = 8000;
}

/// A peer-visible protocol error: a numeric code plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer error {code}: {message}")]
pub struct PeerError {
    pub code: i64,
    pub message: String,
}

impl PeerError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn user_rejected() -> Self {
        Self::new(code::USER_REJECTED, "User rejected")
    }

    pub fn request_expired() -> Self {
        Self::new(code::SESSION_REQUEST_EXPIRED, "Request expired")
    }
}

impl From<PeerError> for RpcErrorBody {
    fn from(err: PeerError) -> Self {
        RpcErrorBody { code: err.code, message: err.message }
    }
}

impl From<RpcErrorBody> for PeerError {
    fn from(body: RpcErrorBody) -> Self {
        Self { code: body.code, message: body.message }
    }
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("no session for topic {topic}")]
    UnknownSession { topic: Topic },

    #[error("no proposal with request id {id}")]
    UnknownProposal { id: RequestId },

    #[error("no pairing for topic {topic}")]
    UnknownPairing { topic: Topic },

    #[error("no pending authenticate request with id {id}")]
    UnknownAuthRequest { id: RequestId },

    #[error("session {topic} has expired")]
    SessionExpired { topic: Topic },

    #[error("proposal {id} has expired")]
    ProposalExpired { id: RequestId },

    #[error("{subject} is not authorized by the session namespaces")]
    Unauthorized { subject: String },

    #[error("invalid namespaces: {reason}")]
    InvalidNamespaces { reason: String },

    #[error("invalid auth signature from {issuer}")]
    InvalidCacao { issuer: String },

    #[error("invalid pairing uri: {reason}")]
    InvalidUri { reason: String },

    #[error("malformed {method} payload: {reason}")]
    MalformedPayload { method: &'static str, reason: String },

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SignError {
    pub fn unauthorized(subject: impl Into<String>) -> Self {
        Self::Unauthorized { subject: subject.into() }
    }

    pub fn invalid_namespaces(reason: impl Into<String>) -> Self {
        Self::InvalidNamespaces { reason: reason.into() }
    }

    pub(crate) fn malformed(method: &'static str, err: impl std::fmt::Display) -> Self {
        Self::MalformedPayload { method, reason: err.to_string() }
    }
}
