//! Wallet-service interception: a registered handler can answer a session
//! request out of band before the normal in-session publish happens.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use tacit_store::Topic;

use crate::error::PeerError;

/// A service that can answer certain session request methods directly,
/// without involving the peer. First registered handler that claims the
/// method wins; if none claims it the request goes over the session topic.
#[async_trait]
pub trait WalletServiceHandler: Send + Sync {
    /// Whether this service answers `method` at all.
    fn handles(&self, method: &str) -> bool;

    /// Answer the request. Returning an error produces the same shape a peer
    /// error response would.
    async fn handle(
        &self,
        topic: &Topic,
        chain_id: &str,
        method: &str,
        params: &JsonValue,
    ) -> Result<JsonValue, PeerError>;
}
