//! Signaling channel abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::Result;
use crate::signaling::protocol::SignalMessage;

/// Connectivity of a link, reported by the signaling channel for itself and
/// reused for aggregate session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// No connection and none in progress
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Link is up
    Connected,
    /// Link is down and not recovering on its own
    Failed,
}

impl LinkStatus {
    /// True when the link is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkStatus::Connected)
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
            LinkStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Bidirectional out-of-band message relay.
///
/// Implementations wrap the real transport (a WebSocket relay, a push
/// service). No delivery guarantee is assumed, not even at-least-once;
/// orchestration correctness does not depend on one. Implementations manage
/// their own reconnect semantics and report connectivity through
/// [`status`](SignalingChannel::status).
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a message to the remote end
    async fn send(&self, message: SignalMessage) -> Result<()>;

    /// Subscribe to inbound messages
    fn subscribe(&self) -> broadcast::Receiver<SignalMessage>;

    /// Current channel connectivity
    fn status(&self) -> LinkStatus;

    /// Watch connectivity transitions
    fn watch_status(&self) -> watch::Receiver<LinkStatus>;
}
