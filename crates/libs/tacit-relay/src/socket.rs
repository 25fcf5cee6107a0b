use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::RelayError;

/// Events observed on the managed duplex connection.
#[derive(Clone, Debug, PartialEq)]
pub enum SocketEvent {
    Opened,
    Closed { reason: String },
    Message(String),
}

/// The managed duplex connection to the relay.
///
/// Implementations own the actual wire (websocket or an in-process pair in
/// tests) and report everything through the event stream; `connect` returns
/// once the attempt is started, not once the socket is open.
#[async_trait]
pub trait RelaySocket: Send + Sync {
    async fn connect(&self) -> Result<(), RelayError>;

    async fn disconnect(&self) -> Result<(), RelayError>;

    async fn send(&self, frame: String) -> Result<(), RelayError>;

    fn events(&self) -> broadcast::Receiver<SocketEvent>;
}

/// Fail-fast connectivity knowledge ahead of any outbound call.
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Default probe for hosts without platform connectivity signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}
