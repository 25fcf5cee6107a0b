use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, KeyInit, Nonce};
use rand_core::OsRng;

use tacit_store::SymKey;

use crate::error::EnvelopeError;
use crate::keys::decode_public_key;

const TYPE_0: u8 = 0;
const TYPE_1: u8 = 1;
const NONCE_LEN: usize = 12;
const PUBKEY_LEN: usize = 32;

/// Envelope framing variant.
///
/// Type 1 carries the sender's x25519 public key in the clear so the
/// receiver can derive the shared key before a topic association exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeType {
    Type0,
    Type1 { sender_public_key: String },
}

/// One successfully opened envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEnvelope {
    pub plaintext: String,
    /// Present for type-1 envelopes only, hex-encoded.
    pub sender_public_key: Option<String>,
}

/// Seal `plaintext` under `key` and return the base64 wire form.
pub fn seal_envelope(
    key: &SymKey,
    plaintext: &str,
    envelope: &EnvelopeType,
) -> Result<String, EnvelopeError> {
    let cipher = ChaCha20Poly1305::new((&key.0).into());
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext =
        cipher.encrypt(&nonce, plaintext.as_bytes()).map_err(|_| EnvelopeError::Encrypt)?;

    let mut frame = Vec::with_capacity(1 + PUBKEY_LEN + NONCE_LEN + ciphertext.len());
    match envelope {
        EnvelopeType::Type0 => frame.push(TYPE_0),
        EnvelopeType::Type1 { sender_public_key } => {
            frame.push(TYPE_1);
            frame.extend_from_slice(&decode_public_key(sender_public_key)?);
        }
    }
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(frame))
}

/// Open a base64 wire envelope under `key`.
pub fn open_envelope(key: &SymKey, message: &str) -> Result<DecodedEnvelope, EnvelopeError> {
    let frame = BASE64
        .decode(message)
        .map_err(|err| EnvelopeError::InvalidEncoding(format!("base64: {err}")))?;
    let (&envelope_type, rest) = frame
        .split_first()
        .ok_or_else(|| EnvelopeError::InvalidEncoding("empty envelope".to_owned()))?;

    let (sender_public_key, rest) = match envelope_type {
        TYPE_0 => (None, rest),
        TYPE_1 => {
            if rest.len() < PUBKEY_LEN {
                return Err(EnvelopeError::TooShort(TYPE_1));
            }
            let (pubkey, rest) = rest.split_at(PUBKEY_LEN);
            (Some(hex::encode(pubkey)), rest)
        }
        other => return Err(EnvelopeError::UnknownEnvelopeType(other)),
    };

    if rest.len() < NONCE_LEN {
        return Err(EnvelopeError::TooShort(envelope_type));
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new((&key.0).into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EnvelopeError::Decrypt)?;
    let plaintext = String::from_utf8(plaintext)
        .map_err(|err| EnvelopeError::InvalidEncoding(format!("utf-8: {err}")))?;

    Ok(DecodedEnvelope { plaintext, sender_public_key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;

    fn key() -> SymKey {
        SymKey([7u8; 32])
    }

    #[test]
    fn type0_roundtrip() {
        let sealed = seal_envelope(&key(), r#"{"id":1}"#, &EnvelopeType::Type0).expect("seal");
        let opened = open_envelope(&key(), &sealed).expect("open");
        assert_eq!(opened.plaintext, r#"{"id":1}"#);
        assert_eq!(opened.sender_public_key, None);
    }

    #[test]
    fn type1_exposes_sender_public_key() {
        let sender = generate_keypair();
        let envelope = EnvelopeType::Type1 { sender_public_key: sender.public_key.clone() };
        let sealed = seal_envelope(&key(), "hello", &envelope).expect("seal");
        let opened = open_envelope(&key(), &sealed).expect("open");
        assert_eq!(opened.plaintext, "hello");
        assert_eq!(opened.sender_public_key.as_deref(), Some(sender.public_key.as_str()));
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = seal_envelope(&key(), "secret", &EnvelopeType::Type0).expect("seal");
        let err = open_envelope(&SymKey([9u8; 32]), &sealed).unwrap_err();
        assert_eq!(err, EnvelopeError::Decrypt);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let sealed = seal_envelope(&key(), "secret", &EnvelopeType::Type0).expect("seal");
        let mut frame = BASE64.decode(&sealed).expect("decode");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let err = open_envelope(&key(), &BASE64.encode(frame)).unwrap_err();
        assert_eq!(err, EnvelopeError::Decrypt);
    }

    #[test]
    fn unknown_envelope_type_is_rejected() {
        let frame = BASE64.encode([2u8; 40]);
        let err = open_envelope(&key(), &frame).unwrap_err();
        assert_eq!(err, EnvelopeError::UnknownEnvelopeType(2));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert_eq!(open_envelope(&key(), &BASE64.encode([0u8])).unwrap_err(), {
            EnvelopeError::TooShort(0)
        });
        assert_eq!(open_envelope(&key(), &BASE64.encode([1u8; 16])).unwrap_err(), {
            EnvelopeError::TooShort(1)
        });
        assert!(open_envelope(&key(), "not base64!").is_err());
    }
}
