//! Session-level wiring: registry and orchestrator

pub mod orchestrator;
pub mod registry;

pub use orchestrator::SessionOrchestrator;
pub use registry::{AggregateStatus, ConnectionRegistry, MachineFactory};
