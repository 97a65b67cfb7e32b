//! ICE candidate buffering against session-description exchange

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, warn};

use crate::participant::ParticipantId;
use crate::signaling::protocol::CandidatePayload;

/// A candidate held until negotiation readiness
#[derive(Debug, Clone)]
pub struct BufferedCandidate {
    /// Candidate payload as gathered or received
    pub payload: CandidatePayload,

    /// Participant that produced the candidate
    pub source: ParticipantId,

    /// Participant the candidate is addressed to
    pub destination: ParticipantId,

    /// When the candidate entered the queue
    pub queued_at: Instant,
}

/// Candidates released by a readiness flush, in arrival order
#[derive(Debug, Default)]
pub struct FlushedCandidates {
    /// Locally gathered candidates to transmit
    pub outbound: Vec<BufferedCandidate>,

    /// Remotely received candidates to apply
    pub inbound: Vec<BufferedCandidate>,
}

impl FlushedCandidates {
    /// True when the flush released nothing
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}

/// Per-connection ICE candidate buffer.
///
/// WebRTC forbids applying a remote candidate before the remote description
/// is set, and local candidates are useless to the remote end before it holds
/// a description to associate them with. Candidates queue here in arrival
/// order (FIFO, per direction) until [`mark_negotiation_ready`] releases both
/// queues, exactly once per connection instance. Order is preserved because
/// candidate application must not be reordered relative to other candidates.
/// Candidates arriving after readiness bypass the queue and are handed back
/// for immediate use.
///
/// [`mark_negotiation_ready`]: CandidateBuffer::mark_negotiation_ready
#[derive(Debug)]
pub struct CandidateBuffer {
    local: ParticipantId,
    remote: ParticipantId,
    outbound: VecDeque<BufferedCandidate>,
    inbound: VecDeque<BufferedCandidate>,
    ready: bool,
}

impl CandidateBuffer {
    /// Buffer for the connection between `local` and the `remote` participant
    pub fn new(local: ParticipantId, remote: ParticipantId) -> Self {
        Self {
            local,
            remote,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            ready: false,
        }
    }

    /// Queue a locally gathered candidate, or hand it back for immediate
    /// transmission once negotiation is ready
    pub fn buffer_outbound(&mut self, payload: CandidatePayload) -> Option<CandidatePayload> {
        if self.ready {
            return Some(payload);
        }
        self.outbound.push_back(BufferedCandidate {
            payload,
            source: self.local.clone(),
            destination: self.remote.clone(),
            queued_at: Instant::now(),
        });
        debug!(
            participant_id = %self.remote,
            pending = self.outbound.len(),
            "queued outbound candidate"
        );
        None
    }

    /// Queue a remotely received candidate, or hand it back for immediate
    /// application once negotiation is ready
    pub fn buffer_inbound(&mut self, payload: CandidatePayload) -> Option<CandidatePayload> {
        if self.ready {
            return Some(payload);
        }
        self.inbound.push_back(BufferedCandidate {
            payload,
            source: self.remote.clone(),
            destination: self.local.clone(),
            queued_at: Instant::now(),
        });
        debug!(
            participant_id = %self.remote,
            pending = self.inbound.len(),
            "queued inbound candidate"
        );
        None
    }

    /// Release both queues in arrival order, exactly once.
    ///
    /// Idempotent: a second call returns an empty flush and logs nothing new.
    pub fn mark_negotiation_ready(&mut self) -> FlushedCandidates {
        if self.ready {
            return FlushedCandidates::default();
        }
        self.ready = true;
        let flush = FlushedCandidates {
            outbound: self.outbound.drain(..).collect(),
            inbound: self.inbound.drain(..).collect(),
        };
        debug!(
            participant_id = %self.remote,
            outbound = flush.outbound.len(),
            inbound = flush.inbound.len(),
            "negotiation ready, flushing candidates"
        );
        flush
    }

    /// True once negotiation readiness has been marked
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Drop unflushed queues and clear readiness.
    ///
    /// Idempotent. Required before a reconnection attempt reuses this
    /// participant id: stale candidates from a previous connection instance
    /// must never replay into a new one.
    pub fn reset(&mut self) {
        let dropped = self.outbound.len() + self.inbound.len();
        if dropped > 0 {
            warn!(
                participant_id = %self.remote,
                dropped,
                "dropping unflushed candidates on reset"
            );
        }
        self.outbound.clear();
        self.inbound.clear();
        self.ready = false;
    }

    /// Outbound/inbound queue depths
    pub fn pending(&self) -> (usize, usize) {
        (self.outbound.len(), self.inbound.len())
    }
}
