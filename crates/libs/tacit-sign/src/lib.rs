//! Session and pairing negotiation over an encrypted relay.
//!
//! [`SignClient`] drives the whole protocol: out-of-band pairing bootstrap,
//! proposal/approval with key agreement onto a fresh session topic,
//! namespace-gated requests and events, lifetime management (update, extend,
//! delete, expiry sweeps) and one-shot authentication through signed
//! capability objects. Inbound traffic arrives through the relay's decrypted
//! request/response streams and is surfaced as [`SignEvent`]s.

pub mod cacao;
pub mod client;
mod dispatch;
pub mod error;
pub mod events;
pub mod namespaces;
pub mod protocol;
pub mod redirect;

pub use cacao::{AuthPayload, Cacao, CacaoVerifier, Ed25519Verifier};
pub use client::SignClient;
pub use error::{code, PeerError, SignError};
pub use events::SignEvent;
pub use namespaces::{ensure_conforms, merge_namespaces};
pub use protocol::{PairingUri, Participant, SignCall, SignMethod};
pub use redirect::WalletServiceHandler;
