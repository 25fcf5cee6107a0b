//! Relay transport lifecycle and the encrypted JSON-RPC interactor.
//!
//! Two layers live here:
//!
//! - [`LifecycleManager`] owns the one duplex socket to the relay: connection
//!   state, serialized (re)connect attempts with a bounded retry budget, and
//!   the two multicast streams every caller filters: call results by id and
//!   inbound `irn_subscription` pushes by topic.
//! - [`RelayClient`] is the request/response layer above it: per-topic
//!   envelope encryption, history-guarded publish deduplication, inbound
//!   triage (request / result / error), subscription and batch-subscription
//!   management.
//!
//! The relay only ever sees ciphertext and topic identifiers.

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod rpc;
pub mod socket;
pub mod subscriptions;

pub use client::{InboundRequest, InboundResponse, InternalError, OutboundRequest, RelayClient};
pub use config::ClientConfig;
pub use error::RelayError;
pub use lifecycle::{ConnectionState, LifecycleManager};
pub use rpc::{generate_request_id, RpcErrorBody, RpcPayload, SubscriptionData, SubscriptionPush};
pub use socket::{AlwaysOnline, ConnectivityProbe, RelaySocket, SocketEvent};
pub use subscriptions::SubscriptionSet;
