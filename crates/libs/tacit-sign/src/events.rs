use serde_json::Value as JsonValue;

use tacit_store::{Proposal, RequestId, Session, SessionNamespaces, Topic};

use crate::cacao::AuthPayload;
use crate::error::PeerError;
use crate::protocol::Participant;

/// Everything the client surfaces to the application. Broadcast; slow
/// consumers lag rather than block the dispatcher.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SignEvent {
    /// A peer proposed a session over a pairing topic.
    SessionProposal { proposal: Proposal },
    /// A session reached the Active state, on either side of the handshake.
    SessionSettled { session: Session },
    /// The peer declined our session proposal.
    SessionRejected { id: RequestId, reason: PeerError },
    /// A peer invoked a namespace method and awaits a response.
    SessionRequest {
        topic: Topic,
        id: RequestId,
        chain_id: String,
        method: String,
        params: JsonValue,
    },
    /// The peer answered one of our session requests.
    SessionResponse { topic: Topic, id: RequestId, outcome: Result<JsonValue, PeerError> },
    /// The namespace map was replaced, locally or by the peer.
    SessionUpdated { topic: Topic, namespaces: SessionNamespaces },
    /// The session lifetime was extended.
    SessionExtended { topic: Topic, expiry: i64 },
    /// The session was torn down deliberately. `reason` is set for
    /// peer-initiated deletes.
    SessionDeleted { topic: Topic, reason: Option<PeerError> },
    /// The session outlived its expiry and was pruned.
    SessionExpired { topic: Topic },
    /// The peer emitted a namespace event.
    SessionEvent { topic: Topic, chain_id: String, name: String, data: JsonValue },
    /// A ping round-trip completed.
    SessionPingResponded { topic: Topic },
    /// The pairing was torn down deliberately.
    PairingDeleted { topic: Topic },
    /// The pairing outlived its expiry and was pruned.
    PairingExpired { topic: Topic },
    /// A stored proposal outlived its expiry and was pruned unanswered.
    ProposalExpired { id: RequestId },
    /// A peer asked for one-shot authentication.
    SessionAuthenticateRequest {
        id: RequestId,
        topic: Topic,
        requester: Participant,
        payload: AuthPayload,
    },
    /// Authentication completed and a session was synthesized from it.
    SessionAuthenticated { session: Session },
    /// The peer declined our authenticate request.
    SessionAuthenticateRejected { id: RequestId, reason: PeerError },
}
