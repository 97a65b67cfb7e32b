//! Connection lifecycle phases

use crate::participant::ParticipantId;
use crate::signaling::protocol::current_timestamp_ms;

/// Which side of the description exchange this endpoint is driving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationDirection {
    /// Creates and sends the offer
    Offering,
    /// Receives the offer and answers
    Answering,
}

impl std::fmt::Display for NegotiationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NegotiationDirection::Offering => "offering",
            NegotiationDirection::Answering => "answering",
        };
        f.write_str(s)
    }
}

/// Derived overall phase of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    /// Machine exists, no negotiation started
    Idle,
    /// Description exchange in progress
    Signaling(NegotiationDirection),
    /// Descriptions applied, ICE connectivity checks running
    IceNegotiating,
    /// Transport up and at least one media slot carrying a live track
    Connected,
    /// Live but unhealthy; may recover to connected
    Degraded,
    /// Transport failed or retries exhausted
    Failed,
    /// Terminal; reconnecting this participant id needs a new machine
    Closed,
}

impl ConnectionPhase {
    /// True for phases where the transport may carry or regain media
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionPhase::Signaling(_)
                | ConnectionPhase::IceNegotiating
                | ConnectionPhase::Connected
                | ConnectionPhase::Degraded
        )
    }

    /// True once the machine can never leave this phase
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionPhase::Closed)
    }

    /// True while descriptions or ICE checks are still settling
    pub fn is_mid_negotiation(&self) -> bool {
        matches!(
            self,
            ConnectionPhase::Signaling(_) | ConnectionPhase::IceNegotiating
        )
    }

    /// Whether the lifecycle permits moving to `next`.
    ///
    /// Reconnection re-enters `Signaling` from `Degraded` or `Failed` under a
    /// new generation; `Closed` accepts no exit.
    pub fn can_transition_to(&self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (*self, next),
            (Idle, Signaling(_))
                | (Signaling(_), IceNegotiating)
                | (IceNegotiating, Connected)
                | (Connected, Degraded)
                | (Degraded, Connected)
                | (Signaling(_), Failed)
                | (IceNegotiating, Failed)
                | (Connected, Failed)
                | (Degraded, Failed)
                | (Degraded, Signaling(_))
                | (Failed, Signaling(_))
                | (Idle, Closed)
                | (Signaling(_), Closed)
                | (IceNegotiating, Closed)
                | (Connected, Closed)
                | (Degraded, Closed)
                | (Failed, Closed)
        )
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Idle => f.write_str("idle"),
            ConnectionPhase::Signaling(direction) => write!(f, "signaling({})", direction),
            ConnectionPhase::IceNegotiating => f.write_str("ice-negotiating"),
            ConnectionPhase::Connected => f.write_str("connected"),
            ConnectionPhase::Degraded => f.write_str("degraded"),
            ConnectionPhase::Failed => f.write_str("failed"),
            ConnectionPhase::Closed => f.write_str("closed"),
        }
    }
}

/// Structured record of one phase transition
#[derive(Debug, Clone)]
pub struct PhaseEvent {
    /// Participant whose connection transitioned
    pub participant_id: ParticipantId,

    /// Phase before the transition
    pub from: ConnectionPhase,

    /// Phase after the transition
    pub to: ConnectionPhase,

    /// Machine generation at emission
    pub generation: u64,

    /// Epoch milliseconds at emission
    pub timestamp_ms: u64,
}

impl PhaseEvent {
    pub fn new(
        participant_id: ParticipantId,
        from: ConnectionPhase,
        to: ConnectionPhase,
        generation: u64,
    ) -> Self {
        Self {
            participant_id,
            from,
            to,
            generation,
            timestamp_ms: current_timestamp_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionPhase::*;
    use NegotiationDirection::*;

    #[test]
    fn test_nominal_lifecycle_is_permitted() {
        assert!(Idle.can_transition_to(Signaling(Offering)));
        assert!(Signaling(Offering).can_transition_to(IceNegotiating));
        assert!(IceNegotiating.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Connected));
        assert!(Degraded.can_transition_to(Closed));
    }

    #[test]
    fn test_failure_reachable_from_live_phases_only() {
        assert!(Signaling(Answering).can_transition_to(Failed));
        assert!(IceNegotiating.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Failed));
        assert!(Degraded.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Failed));
    }

    #[test]
    fn test_reconnect_reenters_signaling() {
        assert!(Failed.can_transition_to(Signaling(Offering)));
        assert!(Degraded.can_transition_to(Signaling(Offering)));
        assert!(!Connected.can_transition_to(Signaling(Offering)));
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(!Closed.can_transition_to(Idle));
        assert!(!Closed.can_transition_to(Signaling(Offering)));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Closed));
        assert!(Closed.is_terminal());
    }

    #[test]
    fn test_shortcut_transitions_rejected() {
        assert!(!Idle.can_transition_to(Connected));
        assert!(!Idle.can_transition_to(IceNegotiating));
        assert!(!Signaling(Offering).can_transition_to(Connected));
        assert!(!IceNegotiating.can_transition_to(Degraded));
    }

    #[test]
    fn test_live_phase_classification() {
        assert!(Signaling(Offering).is_live());
        assert!(IceNegotiating.is_live());
        assert!(Connected.is_live());
        assert!(Degraded.is_live());
        assert!(!Idle.is_live());
        assert!(!Failed.is_live());
        assert!(!Closed.is_live());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Idle.to_string(), "idle");
        assert_eq!(Signaling(Offering).to_string(), "signaling(offering)");
        assert_eq!(Signaling(Answering).to_string(), "signaling(answering)");
        assert_eq!(IceNegotiating.to_string(), "ice-negotiating");
        assert_eq!(Closed.to_string(), "closed");
    }
}
