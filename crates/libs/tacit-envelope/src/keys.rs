use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use tacit_store::{StoredKeypair, SymKey, Topic};

use crate::error::EnvelopeError;

/// Fresh x25519 keypair with hex-encoded public key.
pub fn generate_keypair() -> StoredKeypair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    StoredKeypair { public_key: hex::encode(public.as_bytes()), secret: secret.to_bytes() }
}

/// Shared symmetric key: HKDF-SHA256 expand over the raw x25519 shared secret.
pub fn derive_sym_key(our_secret: &[u8; 32], their_public_hex: &str) -> Result<SymKey, EnvelopeError> {
    let their_public = decode_public_key(their_public_hex)?;
    let secret = StaticSecret::from(*our_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(their_public));

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(&[], &mut key).map_err(|_| EnvelopeError::Encrypt)?;
    Ok(SymKey(key))
}

/// Topic bound to a symmetric key: SHA-256 of the key bytes.
pub fn topic_from_key(key: &SymKey) -> Topic {
    let digest = Sha256::digest(key.0);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Topic::from_bytes(bytes)
}

pub(crate) fn decode_public_key(raw: &str) -> Result<[u8; 32], EnvelopeError> {
    let bytes = hex::decode(raw)
        .map_err(|err| EnvelopeError::InvalidEncoding(format!("public key: {err}")))?;
    bytes
        .try_into()
        .map_err(|_| EnvelopeError::InvalidEncoding("public key must be 32 bytes".to_owned()))
}
