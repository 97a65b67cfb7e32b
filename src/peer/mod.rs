//! Per-participant connection lifecycle

pub mod machine;
pub mod phase;

pub use machine::{ConnectionDescriptor, ConnectionMachine};
pub use phase::{ConnectionPhase, NegotiationDirection, PhaseEvent};
