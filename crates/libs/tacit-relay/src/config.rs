use std::time::Duration;

/// Per-client relay configuration.
///
/// Defaults mirror the protocol constants; tests shrink the timeouts.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Deadline for one connection establishment observation.
    pub connect_timeout: Duration,
    /// Deadline for a correlated result to any relay call.
    pub call_timeout: Duration,
    /// Automatic reconnect triggers per connect attempt before giving up.
    pub max_reconnects: u32,
    /// Topics per `irn_batchSubscribe` chunk (protocol batch limit).
    pub batch_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(60),
            max_reconnects: 3,
            batch_chunk_size: 500,
        }
    }
}
