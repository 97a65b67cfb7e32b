//! Shared helpers for orchestration integration tests
//!
//! Wires two [`SessionOrchestrator`]s (one host, one participant) over an
//! in-memory signaling pair, plus waiters for phases and observer events.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stagelink::{
    ConnectionPhase, InMemorySignaling, OrchestratorConfig, OrchestratorEvent, ParticipantId,
    Role, SessionOrchestrator, SignalingChannel,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,stagelink=debug")
        .try_init();
}

/// A host/participant orchestrator pair over linked in-memory channels
pub struct SessionPair {
    pub host: SessionOrchestrator,
    pub participant: SessionOrchestrator,
    pub host_channel: Arc<InMemorySignaling>,
    pub participant_channel: Arc<InMemorySignaling>,
}

impl SessionPair {
    pub fn new(host_config: OrchestratorConfig, participant_config: OrchestratorConfig) -> Self {
        let (host_channel, participant_channel) = InMemorySignaling::pair();
        let host = SessionOrchestrator::new(
            Role::Host,
            host_config,
            host_channel.clone() as Arc<dyn SignalingChannel>,
        )
        .expect("host orchestrator");
        let participant = SessionOrchestrator::new(
            Role::Participant,
            participant_config,
            participant_channel.clone() as Arc<dyn SignalingChannel>,
        )
        .expect("participant orchestrator");
        Self {
            host,
            participant,
            host_channel,
            participant_channel,
        }
    }

    pub async fn start(&self) {
        self.host.start().await.expect("host start");
        self.participant.start().await.expect("participant start");
    }

    pub async fn shutdown(&self) {
        self.host.shutdown().await;
        self.participant.shutdown().await;
    }
}

/// Wait until the machine for `participant_id` reports `phase`
pub async fn wait_for_phase(
    orchestrator: &SessionOrchestrator,
    participant_id: &ParticipantId,
    phase: ConnectionPhase,
) {
    timeout(WAIT, async {
        loop {
            if let Ok(machine) = orchestrator.participant(participant_id).await {
                if machine.phase() == phase {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for phase {}", phase));
}

/// Receive events until `matches` accepts one, or time out
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    mut matches: F,
) -> OrchestratorEvent
where
    F: FnMut(&OrchestratorEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("observer stream closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for observer event")
}
