//! Chain-agnostic capability objects (CACAO) exchanged during one-shot
//! authentication, plus the canonical sign-in message they commit to.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::SignError;

/// What the originator asks the responder to sign.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// Payload type, `caip122` for the canonical message below.
    #[serde(rename = "type")]
    pub kind: String,
    pub domain: String,
    pub aud: String,
    pub nonce: String,
    /// RFC 3339 issue timestamp.
    pub iat: String,
    pub chains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CacaoHeader {
    /// Header type, matches the payload's `type`.
    #[serde(rename = "t")]
    pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CacaoPayload {
    /// DID of the signer, e.g. `did:pkh:eip155:1:0x..`.
    pub iss: String,
    pub domain: String,
    pub aud: String,
    pub version: String,
    pub nonce: String,
    pub iat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CacaoSignature {
    /// Signature scheme, e.g. `ed25519`.
    #[serde(rename = "t")]
    pub kind: String,
    /// Hex-encoded signature bytes.
    #[serde(rename = "s")]
    pub signature: String,
}

/// One signed capability: who signed what, and the signature over the
/// canonical message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Cacao {
    #[serde(rename = "h")]
    pub header: CacaoHeader,
    #[serde(rename = "p")]
    pub payload: CacaoPayload,
    #[serde(rename = "s")]
    pub signature: CacaoSignature,
}

impl Cacao {
    /// Build the payload a responder signs for one of its accounts.
    pub fn payload_for(auth: &AuthPayload, iss: impl Into<String>) -> CacaoPayload {
        CacaoPayload {
            iss: iss.into(),
            domain: auth.domain.clone(),
            aud: auth.aud.clone(),
            version: "1".to_owned(),
            nonce: auth.nonce.clone(),
            iat: auth.iat.clone(),
            statement: auth.statement.clone(),
            exp: auth.exp.clone(),
            nbf: auth.nbf.clone(),
            resources: auth.resources.clone(),
        }
    }

    /// CAIP-10 account of the issuer DID, e.g. `eip155:1:0x..` from
    /// `did:pkh:eip155:1:0x..`.
    pub fn issuer_account(&self) -> Option<&str> {
        let rest = self.payload.iss.strip_prefix("did:")?;
        let (_method, account) = rest.split_once(':')?;
        if account.is_empty() {
            return None;
        }
        Some(account)
    }

    /// Chain id of the issuer account.
    pub fn issuer_chain(&self) -> Option<&str> {
        self.issuer_account()?.rsplit_once(':').map(|(chain, _address)| chain)
    }
}

/// The canonical sign-in message committed to by a signature. Line layout is
/// part of the wire contract; any change invalidates existing signatures.
pub fn canonical_message(payload: &CacaoPayload) -> String {
    let account = payload
        .iss
        .strip_prefix("did:")
        .and_then(|rest| rest.split_once(':'))
        .map(|(_method, account)| account)
        .unwrap_or(payload.iss.as_str());
    let address = account.rsplit_once(':').map(|(_chain, address)| address).unwrap_or(account);
    let chain = account.rsplit_once(':').map(|(chain, _address)| chain).unwrap_or("");

    let mut message = format!(
        "{} wants you to sign in with your blockchain account:\n{}\n",
        payload.domain, address
    );
    if let Some(statement) = &payload.statement {
        message.push_str(&format!("\n{statement}\n"));
    }
    message.push_str(&format!(
        "\nURI: {}\nVersion: {}\nChain ID: {}\nNonce: {}\nIssued At: {}",
        payload.aud, payload.version, chain, payload.nonce, payload.iat
    ));
    if let Some(exp) = &payload.exp {
        message.push_str(&format!("\nExpiration Time: {exp}"));
    }
    if let Some(nbf) = &payload.nbf {
        message.push_str(&format!("\nNot Before: {nbf}"));
    }
    if !payload.resources.is_empty() {
        message.push_str("\nResources:");
        for resource in &payload.resources {
            message.push_str(&format!("\n- {resource}"));
        }
    }
    message
}

/// Signature check for one CACAO. Implementations are chain-specific; the
/// client only requires that verification is deterministic and keyless at the
/// call site.
pub trait CacaoVerifier: Send + Sync {
    fn verify(&self, cacao: &Cacao) -> Result<(), SignError>;
}

/// Default verifier: the issuer address is a hex ed25519 public key and the
/// signature covers the canonical message bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl CacaoVerifier for Ed25519Verifier {
    fn verify(&self, cacao: &Cacao) -> Result<(), SignError> {
        let invalid = || SignError::InvalidCacao { issuer: cacao.payload.iss.clone() };

        if cacao.signature.kind != "ed25519" {
            return Err(invalid());
        }
        let address = cacao
            .issuer_account()
            .and_then(|account| account.rsplit_once(':'))
            .map(|(_chain, address)| address)
            .ok_or_else(invalid)?;

        let key_bytes: [u8; 32] =
            hex::decode(address).ok().and_then(|bytes| bytes.try_into().ok()).ok_or_else(invalid)?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| invalid())?;

        let sig_bytes: [u8; 64] = hex::decode(&cacao.signature.signature)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(invalid)?;
        let signature = Signature::from_bytes(&sig_bytes);

        key.verify(canonical_message(&cacao.payload).as_bytes(), &signature)
            .map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    fn sample_auth() -> AuthPayload {
        AuthPayload {
            kind: "caip122".to_owned(),
            domain: "app.example".to_owned(),
            aud: "https://app.example/login".to_owned(),
            nonce: "32891756".to_owned(),
            iat: "2026-08-28T09:00:00Z".to_owned(),
            chains: vec!["eip155:1".to_owned()],
            statement: Some("Sign in to Example.".to_owned()),
            exp: None,
            nbf: None,
            resources: vec!["urn:recap:example".to_owned()],
        }
    }

    fn signed_cacao(signing: &SigningKey, auth: &AuthPayload) -> Cacao {
        let address = hex::encode(signing.verifying_key().to_bytes());
        let payload = Cacao::payload_for(auth, format!("did:pkh:eip155:1:{address}"));
        let signature = signing.sign(canonical_message(&payload).as_bytes());
        Cacao {
            header: CacaoHeader { kind: "caip122".to_owned() },
            payload,
            signature: CacaoSignature {
                kind: "ed25519".to_owned(),
                signature: hex::encode(signature.to_bytes()),
            },
        }
    }

    #[test]
    fn canonical_message_lists_every_field() {
        let payload = Cacao::payload_for(&sample_auth(), "did:pkh:eip155:1:0xabc");
        let message = canonical_message(&payload);
        assert!(message.starts_with("app.example wants you to sign in"));
        assert!(message.contains("\n0xabc\n"));
        assert!(message.contains("\nSign in to Example.\n"));
        assert!(message.contains("Chain ID: eip155:1"));
        assert!(message.contains("Nonce: 32891756"));
        assert!(message.contains("- urn:recap:example"));
    }

    #[test]
    fn ed25519_verifier_accepts_valid_signature() {
        let signing = SigningKey::generate(&mut OsRng);
        let cacao = signed_cacao(&signing, &sample_auth());
        assert!(Ed25519Verifier.verify(&cacao).is_ok());
        assert_eq!(cacao.issuer_chain(), Some("eip155:1"));
    }

    #[test]
    fn ed25519_verifier_rejects_tampered_payload() {
        let signing = SigningKey::generate(&mut OsRng);
        let mut cacao = signed_cacao(&signing, &sample_auth());
        cacao.payload.nonce = "99999999".to_owned();
        assert!(matches!(
            Ed25519Verifier.verify(&cacao),
            Err(SignError::InvalidCacao { .. })
        ));
    }

    #[test]
    fn ed25519_verifier_rejects_wrong_key() {
        let signing = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let mut cacao = signed_cacao(&signing, &sample_auth());
        let address = hex::encode(other.verifying_key().to_bytes());
        cacao.payload.iss = format!("did:pkh:eip155:1:{address}");
        assert!(Ed25519Verifier.verify(&cacao).is_err());
    }
}
