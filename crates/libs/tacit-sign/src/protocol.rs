//! Wire contract of the session protocol: the closed method set, the publish
//! tag and TTL of every method, and the typed payloads carried inside
//! envelopes.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tacit_store::{
    PeerMetadata, ProposalNamespaces, RequestId, SessionNamespaces, Topic,
};

use crate::cacao::{AuthPayload, Cacao};
use crate::error::SignError;

/// Default session lifetime, 7 days in seconds.
pub const SESSION_TTL: i64 = 7 * 24 * 60 * 60;
/// Inactive pairing lifetime, 5 minutes in seconds.
pub const PAIRING_TTL_INACTIVE: i64 = 5 * 60;
/// Activated pairing lifetime, 30 days in seconds.
pub const PAIRING_TTL_ACTIVE: i64 = 30 * 24 * 60 * 60;
/// Proposal lifetime, 5 minutes in seconds.
pub const PROPOSAL_TTL: i64 = 5 * 60;
/// Authenticate request lifetime, 1 hour in seconds.
pub const AUTH_TTL: i64 = 60 * 60;

/// Unix seconds now. Clock regressions clamp to zero rather than panic.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Every method a peer may send inside an envelope. Closed set: an inbound
/// method outside this enum is answered with a "not supported" error instead
/// of being dispatched dynamically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignMethod {
    SessionPropose,
    SessionSettle,
    SessionRequest,
    SessionUpdate,
    SessionExtend,
    SessionDelete,
    SessionPing,
    SessionEvent,
    SessionAuthenticate,
    PairingPing,
    PairingDelete,
}

impl SignMethod {
    pub const ALL: [SignMethod; 11] = [
        Self::SessionPropose,
        Self::SessionSettle,
        Self::SessionRequest,
        Self::SessionUpdate,
        Self::SessionExtend,
        Self::SessionDelete,
        Self::SessionPing,
        Self::SessionEvent,
        Self::SessionAuthenticate,
        Self::PairingPing,
        Self::PairingDelete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SessionPropose => "wc_sessionPropose",
            Self::SessionSettle => "wc_sessionSettle",
            Self::SessionRequest => "wc_sessionRequest",
            Self::SessionUpdate => "wc_sessionUpdate",
            Self::SessionExtend => "wc_sessionExtend",
            Self::SessionDelete => "wc_sessionDelete",
            Self::SessionPing => "wc_sessionPing",
            Self::SessionEvent => "wc_sessionEvent",
            Self::SessionAuthenticate => "wc_sessionAuthenticate",
            Self::PairingPing => "wc_pairingPing",
            Self::PairingDelete => "wc_pairingDelete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.name() == name)
    }

    /// Publish tag of the request leg.
    pub fn request_tag(self) -> u32 {
        match self {
            Self::PairingDelete => 1000,
            Self::PairingPing => 1002,
            Self::SessionPropose => 1100,
            Self::SessionSettle => 1102,
            Self::SessionUpdate => 1104,
            Self::SessionExtend => 1106,
            Self::SessionRequest => 1108,
            Self::SessionEvent => 1110,
            Self::SessionDelete => 1112,
            Self::SessionPing => 1114,
            Self::SessionAuthenticate => 1116,
        }
    }

    /// Publish tag of the response leg, always request tag plus one.
    pub fn response_tag(self) -> u32 {
        self.request_tag() + 1
    }

    /// Relay retention TTL in seconds for both legs.
    pub fn ttl(self) -> u64 {
        match self {
            Self::SessionPropose | Self::SessionSettle | Self::SessionRequest => 300,
            Self::SessionEvent => 300,
            Self::SessionPing | Self::PairingPing => 30,
            Self::SessionAuthenticate => 3600,
            Self::SessionUpdate
            | Self::SessionExtend
            | Self::SessionDelete
            | Self::PairingDelete => 86400,
        }
    }
}

// ── Payload types ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayProtocol {
    pub protocol: String,
}

impl RelayProtocol {
    pub fn irn() -> Self {
        Self { protocol: "irn".to_owned() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: String,
    pub metadata: PeerMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeParams {
    pub relays: Vec<RelayProtocol>,
    pub proposer: Participant,
    pub required_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_namespaces: Option<ProposalNamespaces>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<BTreeMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoped_properties: Option<BTreeMap<String, JsonValue>>,
    /// Unix seconds.
    pub expiry_timestamp: i64,
}

/// Result body answering a session proposal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposeResponse {
    pub relay: RelayProtocol,
    pub responder_public_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettleParams {
    pub relay: RelayProtocol,
    pub controller: Participant,
    pub namespaces: SessionNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_properties: Option<BTreeMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoped_properties: Option<BTreeMap<String, JsonValue>>,
    /// Unix seconds.
    pub expiry: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestParams {
    pub request: SessionRequestBody,
    pub chain_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestBody {
    pub method: String,
    pub params: JsonValue,
    /// Unix seconds after which the request must not be answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_timestamp: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionUpdateParams {
    pub namespaces: SessionNamespaces,
}

/// Extend carries no body; the receiver bumps to its own default lifetime.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionExtendParams {}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionDeleteParams {
    pub code: i64,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionPingParams {}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionEventParams {
    pub event: SessionEventBody,
    pub chain_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionEventBody {
    pub name: String,
    pub data: JsonValue,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthenticateParams {
    pub requester: Participant,
    pub auth_payload: AuthPayload,
    /// Unix seconds.
    pub expiry_timestamp: i64,
}

/// Result body answering an authenticate request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthenticateResponse {
    pub responder: Participant,
    pub cacaos: Vec<Cacao>,
}

/// One inbound call, decoded against the closed method set.
#[derive(Clone, Debug, PartialEq)]
pub enum SignCall {
    SessionPropose(SessionProposeParams),
    SessionSettle(SessionSettleParams),
    SessionRequest(SessionRequestParams),
    SessionUpdate(SessionUpdateParams),
    SessionExtend(SessionExtendParams),
    SessionDelete(SessionDeleteParams),
    SessionPing,
    SessionEvent(SessionEventParams),
    SessionAuthenticate(SessionAuthenticateParams),
    PairingPing,
    PairingDelete(SessionDeleteParams),
}

impl SignCall {
    pub fn decode(method: SignMethod, params: JsonValue) -> Result<Self, SignError> {
        fn typed<T: serde::de::DeserializeOwned>(
            method: SignMethod,
            params: JsonValue,
        ) -> Result<T, SignError> {
            serde_json::from_value(params).map_err(|err| SignError::malformed(method.name(), err))
        }

        Ok(match method {
            SignMethod::SessionPropose => Self::SessionPropose(typed(method, params)?),
            SignMethod::SessionSettle => Self::SessionSettle(typed(method, params)?),
            SignMethod::SessionRequest => Self::SessionRequest(typed(method, params)?),
            SignMethod::SessionUpdate => Self::SessionUpdate(typed(method, params)?),
            SignMethod::SessionExtend => Self::SessionExtend(typed(method, params)?),
            SignMethod::SessionDelete => Self::SessionDelete(typed(method, params)?),
            SignMethod::SessionPing => Self::SessionPing,
            SignMethod::SessionEvent => Self::SessionEvent(typed(method, params)?),
            SignMethod::SessionAuthenticate => Self::SessionAuthenticate(typed(method, params)?),
            SignMethod::PairingPing => Self::PairingPing,
            SignMethod::PairingDelete => Self::PairingDelete(typed(method, params)?),
        })
    }
}

// ── Pairing URI ───────────────────────────────────────────────────────────────

/// Out-of-band pairing handoff: `wc:{topic}@2?relay-protocol=irn&symKey={hex}`
/// with an optional `expiryTimestamp`.
#[derive(Clone, Debug, PartialEq)]
pub struct PairingUri {
    pub topic: Topic,
    pub sym_key: [u8; 32],
    /// Unix seconds.
    pub expiry: Option<i64>,
}

impl PairingUri {
    pub fn parse(raw: &str) -> Result<Self, SignError> {
        let invalid = |reason: &str| SignError::InvalidUri { reason: reason.to_owned() };

        let rest = raw.strip_prefix("wc:").ok_or_else(|| invalid("missing wc: scheme"))?;
        let (head, query) =
            rest.split_once('?').ok_or_else(|| invalid("missing query string"))?;
        let (topic_raw, version) =
            head.split_once('@').ok_or_else(|| invalid("missing protocol version"))?;
        if version != "2" {
            return Err(invalid("unsupported protocol version"));
        }
        let topic = Topic::parse(topic_raw)
            .map_err(|_| invalid("topic must be 32 hex-encoded bytes"))?;

        let mut sym_key = None;
        let mut expiry = None;
        for pair in query.split('&') {
            let Some((name, value)) = pair.split_once('=') else { continue };
            match name {
                "symKey" => {
                    let bytes = hex::decode(value)
                        .map_err(|_| invalid("symKey must be hex-encoded"))?;
                    let bytes: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| invalid("symKey must be 32 bytes"))?;
                    sym_key = Some(bytes);
                }
                "expiryTimestamp" => {
                    expiry =
                        Some(value.parse::<i64>().map_err(|_| invalid("bad expiryTimestamp"))?);
                }
                _ => {}
            }
        }

        let sym_key = sym_key.ok_or_else(|| invalid("missing symKey"))?;
        Ok(Self { topic, sym_key, expiry })
    }

    pub fn render(&self) -> String {
        let mut uri = format!(
            "wc:{}@2?relay-protocol=irn&symKey={}",
            self.topic,
            hex::encode(self.sym_key)
        );
        if let Some(expiry) = self.expiry {
            uri.push_str(&format!("&expiryTimestamp={expiry}"));
        }
        uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_method_round_trips_through_its_name() {
        for method in SignMethod::ALL {
            assert_eq!(SignMethod::from_name(method.name()), Some(method));
        }
        assert_eq!(SignMethod::from_name("wc_sessionMint"), None);
    }

    #[test]
    fn response_tags_follow_request_tags() {
        assert_eq!(SignMethod::SessionPropose.request_tag(), 1100);
        assert_eq!(SignMethod::SessionPropose.response_tag(), 1101);
        assert_eq!(SignMethod::SessionRequest.request_tag(), 1108);
        assert_eq!(SignMethod::PairingDelete.response_tag(), 1001);
    }

    #[test]
    fn decode_rejects_malformed_params() {
        let err = SignCall::decode(SignMethod::SessionRequest, serde_json::json!({"nope": 1}))
            .expect_err("missing fields");
        assert!(matches!(err, SignError::MalformedPayload { method: "wc_sessionRequest", .. }));
    }

    #[test]
    fn pairing_uri_round_trips() {
        let uri = PairingUri {
            topic: Topic::generate(),
            sym_key: [7u8; 32],
            expiry: Some(1_700_000_000),
        };
        let parsed = PairingUri::parse(&uri.render()).expect("parse rendered uri");
        assert_eq!(parsed, uri);
    }

    #[test]
    fn pairing_uri_rejects_bad_input() {
        assert!(PairingUri::parse("http://example.com").is_err());
        assert!(PairingUri::parse("wc:abcd@2?symKey=00").is_err());
        let topic = Topic::generate();
        assert!(PairingUri::parse(&format!("wc:{topic}@1?symKey={}", "00".repeat(32))).is_err());
        assert!(PairingUri::parse(&format!("wc:{topic}@2?relay-protocol=irn")).is_err());
    }
}
