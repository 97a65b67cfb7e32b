//! Signaling protocol types and channel abstraction

pub mod channel;
pub mod memory;
pub mod protocol;

pub use channel::{LinkStatus, SignalingChannel};
pub use memory::InMemorySignaling;
pub use protocol::{
    current_timestamp_ms, CandidatePayload, DescriptionPayload, JoinPayload, SignalEvent,
    SignalMessage,
};
