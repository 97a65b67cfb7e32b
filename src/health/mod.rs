//! Connection health sampling and classification

pub mod monitor;

pub use monitor::{HealthHandle, HealthMonitor, HealthSample, HealthStatus};
