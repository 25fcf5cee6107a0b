mod history;
mod keys;
mod negotiation;

pub use history::RequestHistory;
pub use keys::KeyStore;
pub use negotiation::{PairingRepository, ProposalRepository, SessionRepository};
