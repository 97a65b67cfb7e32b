//! Automatic recovery scheduling with bounded, debounced retries.
//!
//! The controller reacts to phase-level failure signals. It never samples
//! connections itself; the health monitor and the transport callbacks own
//! detection, and everything arrives here through the phase event channel.
//!
//! Per participant it guarantees: at most one recovery attempt in flight,
//! linearly growing delays (`base_delay × attempt_number`, capped), a
//! debounce window collapsing rapid independent failure signals, and a
//! hard attempt budget. Exhausting the budget latches the participant
//! until a manual reconnect clears it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::Error;
use crate::events::OrchestratorEvent;
use crate::participant::{ParticipantId, Role};
use crate::peer::machine::ConnectionMachine;
use crate::peer::phase::{ConnectionPhase, PhaseEvent};

/// Retry bookkeeping for one participant.
#[derive(Default)]
struct RetryEntry {
    /// Attempts consumed in the current failure episode
    attempts: u32,
    last_attempt: Option<Instant>,
    /// An attempt is scheduled or running
    in_flight: bool,
    /// Machine generation captured when the in-flight attempt was accepted
    attempt_generation: u64,
    /// Retry budget spent; only a manual reconnect clears this
    exhausted: bool,
    timer: Option<JoinHandle<()>>,
}

/// Schedules recovery attempts for failed participant connections.
pub struct ReconnectController {
    config: ReconnectConfig,
    role: Role,
    observers: broadcast::Sender<OrchestratorEvent>,
    entries: Mutex<HashMap<ParticipantId, RetryEntry>>,
}

impl ReconnectController {
    pub fn new(
        config: ReconnectConfig,
        role: Role,
        observers: broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            config,
            role,
            observers,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// React to a phase transition for `machine`.
    ///
    /// `connected` resets the participant's retry state; `failed` feeds the
    /// scheduling logic. Other phases are none of the controller's business.
    pub async fn handle_phase_event(
        self: &Arc<Self>,
        machine: &Arc<ConnectionMachine>,
        event: &PhaseEvent,
    ) {
        match event.to {
            ConnectionPhase::Connected => self.note_connected(machine.participant_id()).await,
            ConnectionPhase::Failed => self.on_failure_signal(machine, event.generation).await,
            _ => {}
        }
    }

    /// Process one failure signal for `machine`.
    ///
    /// `generation` is the machine generation the signal was emitted under;
    /// it distinguishes the conclusion of the controller's own attempt
    /// (which schedules the next one immediately) from duplicate signals
    /// for a failure already being handled.
    pub async fn on_failure_signal(
        self: &Arc<Self>,
        machine: &Arc<ConnectionMachine>,
        generation: u64,
    ) {
        let participant_id = machine.participant_id().clone();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(participant_id.clone()).or_default();

        let concluded_own_attempt = entry.in_flight && generation > entry.attempt_generation;
        if entry.in_flight && !concluded_own_attempt {
            debug!(
                "Participant {} failure signal ignored: attempt already in flight",
                participant_id
            );
            return;
        }
        entry.in_flight = false;

        if entry.exhausted {
            debug!(
                "Participant {} failure signal ignored: retries exhausted",
                participant_id
            );
            return;
        }

        if !concluded_own_attempt {
            if let Some(last) = entry.last_attempt {
                if last.elapsed().as_millis() < u128::from(self.config.debounce_ms) {
                    debug!(
                        "Participant {} failure signal dropped within debounce window",
                        participant_id
                    );
                    return;
                }
            }
        }

        let max_attempts = self.config.max_attempts_for(self.role);
        if entry.attempts >= max_attempts {
            entry.exhausted = true;
            let error = Error::RetriesExhausted {
                participant_id: participant_id.to_string(),
                attempts: entry.attempts,
            };
            warn!("{}; automatic recovery disabled", error);
            let _ = self.observers.send(OrchestratorEvent::ReconnectExhausted {
                participant_id,
                attempts: entry.attempts,
            });
            return;
        }

        entry.attempts += 1;
        let attempt = entry.attempts;
        entry.in_flight = true;
        entry.attempt_generation = machine.generation();
        entry.last_attempt = Some(Instant::now());

        let delay = self.config.delay_for_attempt(attempt);
        info!(
            "Participant {} scheduling reconnect attempt {}/{} in {}ms",
            participant_id,
            attempt,
            max_attempts,
            delay.as_millis()
        );
        let _ = self.observers.send(OrchestratorEvent::ReconnectScheduled {
            participant_id: participant_id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let machine_weak = Arc::downgrade(machine);
        let controller_weak = Arc::downgrade(self);
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(machine) = machine_weak.upgrade() else {
                return;
            };
            match machine.begin_reconnect().await {
                Ok(true) => {}
                Ok(false) => {
                    // Machine left the recoverable phases while we waited
                    // (e.g. the remote side restarted it first). Unblock the
                    // entry so later failures are handled.
                    if let Some(controller) = controller_weak.upgrade() {
                        controller.clear_in_flight(machine.participant_id()).await;
                    }
                }
                Err(e) => {
                    // The machine re-entered `failed` under a newer
                    // generation; that phase event drives the next attempt.
                    warn!(
                        "Participant {} reconnect attempt {} failed to start: {}",
                        machine.participant_id(),
                        attempt,
                        e
                    );
                }
            }
        }));
    }

    /// Manually trigger recovery: clears the attempt counter and the
    /// exhaustion latch, cancels any pending timer and starts immediately,
    /// bypassing the debounce window.
    pub async fn force_reconnect(
        self: &Arc<Self>,
        machine: &Arc<ConnectionMachine>,
    ) -> crate::error::Result<bool> {
        let participant_id = machine.participant_id().clone();
        {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(participant_id.clone()).or_default();
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.attempts = 1;
            entry.exhausted = false;
            entry.in_flight = true;
            entry.attempt_generation = machine.generation();
            entry.last_attempt = Some(Instant::now());
        }

        info!("Participant {} manual reconnect requested", participant_id);
        let started = machine.begin_reconnect().await?;
        if !started {
            self.clear_in_flight(&participant_id).await;
        }
        Ok(started)
    }

    /// Drop retry state for a participant and abort any pending attempt.
    pub async fn cancel(&self, participant_id: &ParticipantId) {
        let mut entries = self.entries.lock().await;
        if let Some(mut entry) = entries.remove(participant_id) {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            debug!("Participant {} reconnect state cancelled", participant_id);
        }
    }

    /// Cancel every pending attempt. Used at session teardown.
    pub async fn cancel_all(&self) {
        let mut entries = self.entries.lock().await;
        for (participant_id, entry) in entries.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
                debug!(
                    "Participant {} pending reconnect aborted",
                    participant_id
                );
            }
        }
        entries.clear();
    }

    /// Attempts consumed by the current failure episode
    pub async fn attempts(&self, participant_id: &ParticipantId) -> u32 {
        let entries = self.entries.lock().await;
        entries
            .get(participant_id)
            .map(|entry| entry.attempts)
            .unwrap_or(0)
    }

    /// Whether automatic recovery is disabled for a participant
    pub async fn is_exhausted(&self, participant_id: &ParticipantId) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(participant_id)
            .map(|entry| entry.exhausted)
            .unwrap_or(false)
    }

    async fn note_connected(&self, participant_id: &ParticipantId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(participant_id) {
            if entry.attempts > 0 {
                info!(
                    "Participant {} reconnected after {} attempt(s)",
                    participant_id, entry.attempts
                );
            }
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            *entry = RetryEntry::default();
        }
    }

    async fn clear_in_flight(&self, participant_id: &ParticipantId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(participant_id) {
            entry.in_flight = false;
        }
    }
}
