//! Media slots, acquisition, and relay interfaces

pub mod relay;
pub mod slots;
pub mod source;

pub use relay::{MediaRelay, TrackReceivedCallback};
pub use slots::{MediaKind, SlotSet, SLOT_ORDER};
pub use source::{MediaSource, MediaTrackSet, PumpHandle, StaticMediaSource};
