//! Participant-id keyed machine collection with message routing

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::OrchestratorEvent;
use crate::participant::ParticipantId;
use crate::peer::machine::{ConnectionDescriptor, ConnectionMachine};
use crate::peer::phase::ConnectionPhase;
use crate::signaling::{LinkStatus, SignalEvent, SignalMessage};

/// Builds a machine for a participant id the registry has not seen.
///
/// Injected by the orchestrator, which closes over the channel, config and
/// event senders a machine needs.
pub type MachineFactory = Arc<dyn Fn(ParticipantId) -> Arc<ConnectionMachine> + Send + Sync>;

/// Session-wide status derived from the channel and every connection phase.
///
/// Computed on demand, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateStatus {
    /// Signaling channel link status
    pub signaling: LinkStatus,
    /// Combined status of the peer transports
    pub transport: LinkStatus,
    /// What the session as a whole is doing
    pub overall: LinkStatus,
}

/// Owns the participant-id → machine mapping for one session.
///
/// The registry is the single writer of the mapping. Inbound signaling
/// messages are routed by participant id; a message for an unknown id
/// creates a fresh `idle` machine through the injected factory, since the
/// transport does not guarantee a join arrives before the first offer.
pub struct ConnectionRegistry {
    machines: RwLock<HashMap<ParticipantId, Arc<ConnectionMachine>>>,
    factory: MachineFactory,
    /// Maximum simultaneous participant legs
    capacity: usize,
    observers: broadcast::Sender<OrchestratorEvent>,
}

impl ConnectionRegistry {
    pub fn new(
        capacity: usize,
        factory: MachineFactory,
        observers: broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            machines: RwLock::new(HashMap::new()),
            factory,
            capacity,
            observers,
        }
    }

    /// Route one inbound signaling message to the addressed machine.
    ///
    /// `leave` closes and removes the machine. Every other message kind is
    /// dispatched to the machine for `message.participant_id`, creating one
    /// if the id is unknown.
    pub async fn route(&self, message: SignalMessage) -> Result<()> {
        if message.event == SignalEvent::Leave {
            return self.remove(&message.participant_id).await;
        }

        let machine = self.ensure_machine(&message.participant_id).await?;
        machine.handle_signal(message).await
    }

    /// Look up the machine for a participant
    pub async fn get(&self, participant_id: &ParticipantId) -> Result<Arc<ConnectionMachine>> {
        let machines = self.machines.read().await;
        machines
            .get(participant_id)
            .cloned()
            .ok_or_else(|| Error::ParticipantNotFound(participant_id.to_string()))
    }

    /// Machine for a participant, creating a fresh `idle` one if absent.
    ///
    /// Fails when the participant cap is reached.
    pub async fn ensure_machine(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Arc<ConnectionMachine>> {
        {
            let machines = self.machines.read().await;
            if let Some(machine) = machines.get(participant_id) {
                return Ok(machine.clone());
            }
        }

        let mut machines = self.machines.write().await;
        // Double-check: another task may have inserted while we waited for
        // the write lock.
        if let Some(machine) = machines.get(participant_id) {
            return Ok(machine.clone());
        }

        if machines.len() >= self.capacity {
            return Err(Error::SessionError(format!(
                "participant limit reached ({}), rejecting {}",
                self.capacity, participant_id
            )));
        }

        info!("Registering connection machine for participant {}", participant_id);
        let machine = (self.factory)(participant_id.clone());
        machines.insert(participant_id.clone(), machine.clone());
        let _ = self.observers.send(OrchestratorEvent::ParticipantJoined {
            participant_id: participant_id.clone(),
            role: participant_id.role(),
        });

        Ok(machine)
    }

    /// Close and drop the machine for a participant
    pub async fn remove(&self, participant_id: &ParticipantId) -> Result<()> {
        let machine = {
            let mut machines = self.machines.write().await;
            machines.remove(participant_id)
        };

        match machine {
            Some(machine) => {
                info!("Removing connection machine for participant {}", participant_id);
                if let Err(e) = machine.close().await {
                    warn!("Error closing machine for {}: {}", participant_id, e);
                }
                let _ = self.observers.send(OrchestratorEvent::ParticipantLeft {
                    participant_id: participant_id.clone(),
                });
                Ok(())
            }
            None => {
                debug!("Leave for unknown participant {} ignored", participant_id);
                Ok(())
            }
        }
    }

    /// Snapshot descriptors for every registered leg
    pub async fn list(&self) -> Vec<ConnectionDescriptor> {
        let machines = self.machines.read().await;
        machines.values().map(|machine| machine.descriptor()).collect()
    }

    /// Every registered machine, for per-machine wiring
    pub async fn machines(&self) -> Vec<Arc<ConnectionMachine>> {
        let machines = self.machines.read().await;
        machines.values().cloned().collect()
    }

    /// Number of registered legs
    pub async fn len(&self) -> usize {
        self.machines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.machines.read().await.is_empty()
    }

    pub async fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.machines.read().await.contains_key(participant_id)
    }

    /// Close every machine and clear the mapping. Used at session teardown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut machines = self.machines.write().await;
            machines.drain().collect()
        };

        for (participant_id, machine) in drained {
            debug!("Closing machine for participant {}", participant_id);
            if let Err(e) = machine.close().await {
                warn!("Error closing machine for {}: {}", participant_id, e);
            }
        }
    }

    /// Derive the session-wide status from the channel and every phase.
    ///
    /// `connected` legs and `degraded` legs both count as passing media; a
    /// session with no legs yet is vacuously connected on the transport
    /// side. The rule runs against live phases on every call.
    pub async fn aggregate_status(&self, signaling: LinkStatus) -> AggregateStatus {
        let phases: Vec<ConnectionPhase> = {
            let machines = self.machines.read().await;
            machines
                .values()
                .map(|machine| machine.phase())
                .filter(|phase| *phase != ConnectionPhase::Closed)
                .collect()
        };

        let transport = Self::transport_status(&phases);
        let overall = Self::overall_status(signaling, transport);

        AggregateStatus {
            signaling,
            transport,
            overall,
        }
    }

    fn transport_status(phases: &[ConnectionPhase]) -> LinkStatus {
        if phases.is_empty() {
            return LinkStatus::Connected;
        }
        if phases.iter().all(|phase| {
            matches!(phase, ConnectionPhase::Connected | ConnectionPhase::Degraded)
        }) {
            return LinkStatus::Connected;
        }
        if phases.iter().any(|phase| {
            matches!(
                phase,
                ConnectionPhase::Signaling(_) | ConnectionPhase::IceNegotiating
            )
        }) {
            return LinkStatus::Connecting;
        }
        if phases.iter().all(|phase| *phase == ConnectionPhase::Failed) {
            return LinkStatus::Failed;
        }
        LinkStatus::Disconnected
    }

    fn overall_status(signaling: LinkStatus, transport: LinkStatus) -> LinkStatus {
        if signaling == LinkStatus::Failed || transport == LinkStatus::Failed {
            return LinkStatus::Failed;
        }
        match (signaling, transport) {
            (LinkStatus::Connected, LinkStatus::Connected) => LinkStatus::Connected,
            (LinkStatus::Connected, LinkStatus::Connecting) => LinkStatus::Connecting,
            (LinkStatus::Connecting, _) => LinkStatus::Connecting,
            _ => LinkStatus::Disconnected,
        }
    }
}
