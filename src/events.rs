//! Observer event stream emitted by the orchestration layer.
//!
//! Events are fan-out notifications published on a `tokio::sync::broadcast`
//! channel. They exist for session-level consumers (UI overlays, logging,
//! test harnesses) and never drive connection control flow: dropping or
//! lagging behind the stream cannot change negotiation behavior.

use crate::health::HealthStatus;
use crate::media::MediaKind;
use crate::participant::{ParticipantId, Role};
use crate::peer::phase::ConnectionPhase;
use crate::signaling::LinkStatus;

/// Capacity of the observer broadcast channel. Slow subscribers lag and
/// miss events rather than exerting backpressure on the orchestrator.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification published by the orchestrator and its per-participant
/// connection machines.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// A participant announced itself over signaling and a connection
    /// machine was allocated for it.
    ParticipantJoined {
        participant_id: ParticipantId,
        role: Role,
    },

    /// A participant left and its connection machine was torn down.
    ParticipantLeft { participant_id: ParticipantId },

    /// A connection machine moved between lifecycle phases.
    PhaseChanged {
        participant_id: ParticipantId,
        from: ConnectionPhase,
        to: ConnectionPhase,
        /// Negotiation generation the transition happened under.
        generation: u64,
    },

    /// The health monitor reclassified a connection.
    HealthChanged {
        participant_id: ParticipantId,
        status: HealthStatus,
    },

    /// A remote media track arrived on a connection.
    TrackReceived {
        participant_id: ParticipantId,
        /// `None` when the RTP codec type did not map to a known slot kind.
        kind: Option<MediaKind>,
    },

    /// A reconnection attempt was scheduled after a failure signal.
    ReconnectScheduled {
        participant_id: ParticipantId,
        /// 1-based attempt number about to run.
        attempt: u32,
        delay_ms: u64,
    },

    /// The retry budget for a participant ran out; no further automatic
    /// attempts will be made until a manual reconnect clears the latch.
    ReconnectExhausted {
        participant_id: ParticipantId,
        attempts: u32,
    },

    /// The underlying signaling link changed status.
    SignalingStatusChanged { status: LinkStatus },
}

impl OrchestratorEvent {
    /// Participant the event concerns, when it is scoped to one.
    pub fn participant_id(&self) -> Option<&ParticipantId> {
        match self {
            Self::ParticipantJoined { participant_id, .. }
            | Self::ParticipantLeft { participant_id }
            | Self::PhaseChanged { participant_id, .. }
            | Self::HealthChanged { participant_id, .. }
            | Self::TrackReceived { participant_id, .. }
            | Self::ReconnectScheduled { participant_id, .. }
            | Self::ReconnectExhausted { participant_id, .. } => Some(participant_id),
            Self::SignalingStatusChanged { .. } => None,
        }
    }
}
