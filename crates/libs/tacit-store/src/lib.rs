//! Boundary types and repository traits for the tacit relay client.
//!
//! Persistence is an external collaborator: the core only talks to the
//! repositories defined here. This crate provides:
//!
//! - **Boundary types** shared by every layer (topics, records, sessions,
//!   proposals, namespaces)
//! - **Async trait definitions** for the request history, session, proposal,
//!   pairing, and key repositories
//! - **In-memory implementations** suitable for tests and short-lived
//!   clients
//!
//! # Trait inventory
//!
//! - [`RequestHistory`]: durable request/response correlation records
//! - [`SessionRepository`] / [`ProposalRepository`] / [`PairingRepository`]:
//!   negotiation state
//! - [`KeyStore`]: symmetric keys per topic plus client x25519 keypairs

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::StoreError;
pub use memory::{
    InMemoryHistory, InMemoryKeyStore, InMemoryPairings, InMemoryProposals, InMemorySessions,
};
pub use traits::{
    KeyStore, PairingRepository, ProposalRepository, RequestHistory, SessionRepository,
};
pub use types::*;
