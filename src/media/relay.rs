//! Managed media relay interface

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::peer::phase::ConnectionPhase;

/// Callback invoked when the relay delivers a remote track
pub type TrackReceivedCallback = Arc<dyn Fn(Arc<TrackRemote>) + Send + Sync>;

/// Managed relay alternative to direct peer connections.
///
/// When direct connectivity is infeasible, a hosted relay service can carry
/// media instead. Implementations report connectivity in the same
/// [`ConnectionPhase`] vocabulary as direct connections, so the health
/// monitor and registry need no branching per transport kind.
#[async_trait]
pub trait MediaRelay: Send + Sync {
    /// Send a local track through the relay
    async fn send_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()>;

    /// Register the callback receiving remote tracks
    fn on_track_received(&self, callback: TrackReceivedCallback);

    /// Current relay connectivity in connection-phase vocabulary
    fn connection_phase(&self) -> ConnectionPhase;
}
