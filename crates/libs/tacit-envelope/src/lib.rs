//! Envelope encryption for tacit topics.
//!
//! Two parties derive a shared symmetric key from an x25519 exchange
//! (HKDF-SHA256 over the raw shared secret) and a topic from the SHA-256 of
//! that key. Every relay message is one sealed envelope:
//!
//! ```text
//! type 0: [0x00 | nonce(12) | ciphertext]
//! type 1: [0x01 | sender_pubkey(32) | nonce(12) | ciphertext]
//! ```
//!
//! sealed with ChaCha20-Poly1305 and carried as standard base64. Decode
//! failures are per-message errors, never fatal to the connection.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod keys;

pub use codec::{Codec, KeyedCodec};
pub use envelope::{open_envelope, seal_envelope, DecodedEnvelope, EnvelopeType};
pub use error::EnvelopeError;
pub use keys::{derive_sym_key, generate_keypair, topic_from_key};
