use std::collections::BTreeMap;
use std::fmt;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::StoreError;

// ── Type aliases ──────────────────────────────────────────────────────────────

/// Opaque subscription identifier issued by the relay per (connection, topic).
pub type SubscriptionId = String;

/// 64-bit JSON-RPC request id, globally unique per client while outstanding.
pub type RequestId = u64;

// ── Topic ─────────────────────────────────────────────────────────────────────

/// 32-byte channel/key identifier, hex-encoded.
///
/// A topic is never reused across two unrelated sessions; it is deleted when
/// its session or pairing is deleted or expires.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Random topic, used for fresh pairings.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        if raw.len() != 64 || !raw.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(StoreError::Conflict {
                message: format!("topic must be 32 hex-encoded bytes, got '{raw}'"),
            });
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Key material ──────────────────────────────────────────────────────────────

/// Topic-bound 32-byte symmetric key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey(pub [u8; 32]);

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymKey(..)")
    }
}

/// Client x25519 keypair, stored by hex public key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoredKeypair {
    #[zeroize(skip)]
    pub public_key: String,
    pub secret: [u8; 32],
}

impl fmt::Debug for StoredKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKeypair").field("public_key", &self.public_key).finish()
    }
}

// ── Request history ───────────────────────────────────────────────────────────

/// Transport a request travelled over.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Relay,
    LinkMode,
}

/// One correlated request, created the moment it is sent or first received.
///
/// The response is set at most once; a second response for the same id is a
/// duplicate. Records are pruned when their topic is deleted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingRequestRecord {
    pub id: RequestId,
    pub topic: Topic,
    pub method: String,
    pub body: String,
    pub transport_type: TransportType,
    pub response: Option<String>,
}

// ── Namespaces ────────────────────────────────────────────────────────────────

/// Requested capability set, no accounts bound.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalNamespace {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// Granted capability set with accounts attached.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionNamespace {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<String>,
    pub accounts: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

pub type ProposalNamespaces = BTreeMap<String, ProposalNamespace>;
pub type SessionNamespaces = BTreeMap<String, SessionNamespace>;

// ── Metadata ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Redirect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerMetadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
}

// ── Proposals ─────────────────────────────────────────────────────────────────

/// Stored session proposal, keyed by the propose request id.
///
/// Consumed on approval, discarded on rejection, pruned on expiry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub request_id: RequestId,
    pub pairing_topic: Topic,
    pub proposer_public_key: String,
    pub proposer_metadata: PeerMetadata,
    pub required_namespaces: ProposalNamespaces,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_namespaces: Option<ProposalNamespaces>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoped_properties: Option<BTreeMap<String, JsonValue>>,
    /// Unix seconds.
    pub expiry: i64,
}

// ── Sessions & pairings ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub topic: Topic,
    pub pairing_topic: Topic,
    /// Unix seconds.
    pub expiry: i64,
    /// Invariant: never empty for a stored session.
    pub namespaces: SessionNamespaces,
    pub peer_metadata: PeerMetadata,
    pub self_public_key: String,
    pub peer_public_key: String,
    pub transport_type: TransportType,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    pub topic: Topic,
    /// Unix seconds.
    pub expiry: i64,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<PeerMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_parse_accepts_only_32_hex_bytes() {
        let good = "a".repeat(64);
        assert!(Topic::parse(&good).is_ok());
        assert!(Topic::parse("a0b1").is_err());
        let bad = "g".repeat(64);
        assert!(Topic::parse(&bad).is_err());
    }

    #[test]
    fn topic_parse_normalizes_case() {
        let mixed = format!("{}{}", "AB".repeat(16), "cd".repeat(16));
        let topic = Topic::parse(&mixed).expect("valid topic");
        assert_eq!(topic.as_str(), mixed.to_ascii_lowercase());
    }

    #[test]
    fn generated_topics_differ() {
        assert_ne!(Topic::generate(), Topic::generate());
    }
}
