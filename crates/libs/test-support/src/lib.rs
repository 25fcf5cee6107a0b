//! In-process mock relay for integration tests.
//!
//! [`MockRelay`] implements the relay's server half of the protocol
//! (publish fan-out, subscription management with message retention, batch
//! subscription with scriptable per-call failures, and forced disconnects)
//! over [`MockSocket`] endpoints that plug into
//! [`tacit_relay::RelaySocket`].

mod relay;

pub use relay::{MockRelay, MockSocket};
