//! Periodic per-participant health sampling and failure escalation.
//!
//! The monitor keeps no history: each connection carries only its latest
//! sample plus a rolling counter of consecutive not-healthy samples.
//! Degradation must persist to escalate, recovery is immediate. This
//! asymmetry keeps transient jitter from flapping connections through
//! reconnect cycles.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::events::OrchestratorEvent;
use crate::peer::machine::ConnectionMachine;
use crate::peer::phase::ConnectionPhase;

/// Classification of a single health sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Transport active, a track is present, activity is fresh
    Healthy,
    /// Transport active but track presence or freshness is marginal
    Degraded,
    /// Transport is not active
    Failed,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time reading of one participant connection.
///
/// Superseded by the next sample; only the classification outcome feeds
/// the rolling failure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    /// Lifecycle phase at sampling time
    pub phase: ConnectionPhase,
    /// Transport reported connected
    pub transport_active: bool,
    /// At least one media track bound or received
    pub track_present: bool,
    /// Milliseconds since media last moved on this connection
    pub last_activity_age_ms: u64,
}

impl HealthSample {
    /// Classify this sample against the configured freshness threshold.
    ///
    /// A `freshness_threshold_ms` of 0 disables the freshness check, for
    /// deployments that do not feed activity timestamps.
    pub fn classify(&self, config: &HealthConfig) -> HealthStatus {
        if !self.transport_active {
            return HealthStatus::Failed;
        }
        let fresh = config.freshness_threshold_ms == 0
            || self.last_activity_age_ms < config.freshness_threshold_ms;
        if self.track_present && fresh {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl fmt::Display for HealthSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transport_active={}, track_present={}, last_activity_age={}ms",
            self.transport_active, self.track_present, self.last_activity_age_ms
        )
    }
}

/// What the failure counter decided for one observed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthAction {
    None,
    /// First not-healthy sample after a healthy run
    Degrade,
    /// Escalation threshold reached; fire exactly one failure signal
    Escalate,
    /// Healthy sample after a not-healthy run
    Recover,
}

/// Rolling counter of consecutive not-healthy samples.
///
/// A single healthy sample resets it to zero. After escalating it latches
/// until the next healthy sample, so one sustained outage produces exactly
/// one failure signal.
#[derive(Debug)]
struct FailureCounter {
    threshold: u32,
    consecutive: u32,
    escalated: bool,
}

impl FailureCounter {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
            escalated: false,
        }
    }

    fn observe(&mut self, status: HealthStatus) -> HealthAction {
        if status.is_healthy() {
            let was_down = self.consecutive > 0 || self.escalated;
            self.consecutive = 0;
            self.escalated = false;
            if was_down {
                return HealthAction::Recover;
            }
            return HealthAction::None;
        }

        if self.escalated {
            return HealthAction::None;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.escalated = true;
            HealthAction::Escalate
        } else if self.consecutive == 1 {
            HealthAction::Degrade
        } else {
            HealthAction::None
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
        self.escalated = false;
    }
}

/// Stops a health watch task.
pub struct HealthHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl HealthHandle {
    /// Stop the watch task. Safe to call more than once.
    pub async fn cancel(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Whether the watch task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns and configures per-participant health watch tasks.
pub struct HealthMonitor {
    config: HealthConfig,
    observers: broadcast::Sender<OrchestratorEvent>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, observers: broadcast::Sender<OrchestratorEvent>) -> Self {
        Self { config, observers }
    }

    /// Start sampling a machine on the configured interval.
    ///
    /// Sampling only applies to `connected` and `degraded` phases; other
    /// phases clear the failure counter so a recovering connection starts
    /// from a clean slate. The task exits when the machine closes or is
    /// dropped, or when the handle cancels it.
    pub fn watch(&self, machine: &Arc<ConnectionMachine>) -> HealthHandle {
        let config = self.config.clone();
        let observers = self.observers.clone();
        let weak = Arc::downgrade(machine);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut counter = FailureCounter::new(config.failure_threshold);
            let mut last_status: Option<HealthStatus> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }

                let Some(machine) = weak.upgrade() else { break };
                let phase = machine.phase();
                if phase == ConnectionPhase::Closed {
                    break;
                }
                if !matches!(
                    phase,
                    ConnectionPhase::Connected | ConnectionPhase::Degraded
                ) {
                    counter.reset();
                    last_status = None;
                    continue;
                }

                let sample = machine.health_snapshot().await;
                let status = sample.classify(&config);
                if last_status != Some(status) {
                    debug!(
                        "Participant {} health sample: {} ({})",
                        machine.participant_id(),
                        status,
                        sample
                    );
                    let _ = observers.send(OrchestratorEvent::HealthChanged {
                        participant_id: machine.participant_id().clone(),
                        status,
                    });
                    last_status = Some(status);
                }

                match counter.observe(status) {
                    HealthAction::Degrade => {
                        machine
                            .mark_degraded(&format!("unhealthy sample: {}", sample))
                            .await;
                    }
                    HealthAction::Escalate => {
                        info!(
                            "Participant {} escalating after {} consecutive unhealthy samples",
                            machine.participant_id(),
                            config.failure_threshold
                        );
                        machine
                            .mark_failed("health checks exhausted the failure threshold")
                            .await;
                    }
                    HealthAction::Recover => {
                        machine.mark_recovered().await;
                    }
                    HealthAction::None => {}
                }
            }
        });

        HealthHandle { shutdown_tx, task }
    }
}
