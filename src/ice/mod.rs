//! ICE candidate handling

pub mod buffer;

pub use buffer::{BufferedCandidate, CandidateBuffer, FlushedCandidates};
