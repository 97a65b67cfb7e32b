//! Bounded automatic recovery for failed connections

pub mod controller;

pub use controller::ReconnectController;
