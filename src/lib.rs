//! Connection orchestration for many-to-one WebRTC camera sessions
//!
//! This crate negotiates and maintains peer connections between a set of
//! mobile participant endpoints and a single host endpoint, coordinated
//! through an out-of-band signaling channel.
//!
//! # Features
//!
//! - **Per-participant state machines**: strict lifecycle phases with a
//!   single serialized transition path per participant
//! - **Candidate buffering**: ICE candidates queue in arrival order until the
//!   remote description is applied, then flush exactly once
//! - **Fixed transceiver slots**: one video and one audio slot allocated per
//!   connection, order-checked and never reallocated in place
//! - **Health monitoring**: periodic liveness sampling with asymmetric
//!   escalation (degradation requires persistence, recovery is immediate)
//! - **Bounded reconnection**: debounced, linearly-delayed retries with
//!   per-role budgets and a manual-retry escape hatch
//! - **Pluggable signaling**: any transport implementing `SignalingChannel`,
//!   with an in-memory pair for tests and demos
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Signaling channel (offer/answer/candidate/join/leave)   │
//! │  ↓ (inbound dispatch, arrival order)                     │
//! │  SessionOrchestrator                                     │
//! │  ├─ ConnectionRegistry (participant id → machine)        │
//! │  │   └─ ConnectionMachine (per participant leg)          │
//! │  │       ├─ CandidateBuffer (ICE-vs-SDP ordering)        │
//! │  │       ├─ SlotSet (video/audio transceiver slots)      │
//! │  │       └─ RTCPeerConnection                            │
//! │  ├─ HealthMonitor (one watch task per machine)           │
//! │  └─ ReconnectController (bounded retry scheduling)       │
//! │     ↓                                                    │
//! │  OrchestratorEvent stream (observers: UI, logging)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use stagelink::OrchestratorConfig;
//!
//! let config = OrchestratorConfig {
//!     stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
//!     max_participants: 8,
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_participants, 8);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use stagelink::{
//!     InMemorySignaling, OrchestratorConfig, Role, SessionOrchestrator, SignalingChannel,
//! };
//!
//! # async fn example() -> stagelink::Result<()> {
//! let (host_channel, participant_channel) = InMemorySignaling::pair();
//!
//! let host = SessionOrchestrator::new(
//!     Role::Host,
//!     OrchestratorConfig::default(),
//!     host_channel as Arc<dyn SignalingChannel>,
//! )?;
//! host.start().await?;
//!
//! let participant = SessionOrchestrator::new(
//!     Role::Participant,
//!     OrchestratorConfig::default(),
//!     participant_channel as Arc<dyn SignalingChannel>,
//! )?;
//! participant.start().await?;
//! participant.join().await?;
//!
//! let status = host.status().await;
//! println!("session status: {:?}", status.overall);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod ice;
pub mod media;
pub mod participant;
pub mod peer;
pub mod reconnect;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use config::{HealthConfig, OrchestratorConfig, ReconnectConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use events::OrchestratorEvent;
pub use health::{HealthHandle, HealthMonitor, HealthSample, HealthStatus};
pub use ice::CandidateBuffer;
pub use media::{MediaKind, MediaRelay, MediaSource, MediaTrackSet, SlotSet, StaticMediaSource};
pub use participant::{ParticipantId, Role};
pub use peer::{
    ConnectionDescriptor, ConnectionMachine, ConnectionPhase, NegotiationDirection, PhaseEvent,
};
pub use reconnect::ReconnectController;
pub use session::{AggregateStatus, ConnectionRegistry, SessionOrchestrator};
pub use signaling::{
    CandidatePayload, DescriptionPayload, InMemorySignaling, LinkStatus, SignalEvent,
    SignalMessage, SignalingChannel,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
