//! Top-level session wiring.
//!
//! [`SessionOrchestrator`] connects the pieces: a signaling channel feeds
//! the registry's routing, phase events feed the reconnection controller,
//! and every registered machine gets a health watch. The orchestrator owns
//! the background loops and tears all of it down on `shutdown`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::events::{OrchestratorEvent, EVENT_CHANNEL_CAPACITY};
use crate::health::{HealthHandle, HealthMonitor};
use crate::media::MediaTrackSet;
use crate::participant::{ParticipantId, Role};
use crate::peer::machine::{ConnectionDescriptor, ConnectionMachine};
use crate::peer::phase::PhaseEvent;
use crate::reconnect::ReconnectController;
use crate::session::registry::{AggregateStatus, ConnectionRegistry, MachineFactory};
use crate::signaling::{SignalMessage, SignalingChannel};

type WatcherMap = Arc<std::sync::Mutex<HashMap<ParticipantId, HealthHandle>>>;

/// Orchestrates every connection of one session endpoint.
///
/// A host endpoint runs one orchestrator for the whole roster; a
/// participant endpoint runs one for its single leg to the host. Inbound
/// messages are dispatched in arrival order, so negotiation steps for one
/// participant can never interleave.
pub struct SessionOrchestrator {
    local_id: ParticipantId,
    role: Role,
    config: OrchestratorConfig,
    channel: Arc<dyn SignalingChannel>,
    registry: Arc<ConnectionRegistry>,
    controller: Arc<ReconnectController>,
    observers: broadcast::Sender<OrchestratorEvent>,
    /// Health watch per registered machine; dropping a handle stops its task
    watchers: WatcherMap,
    /// Receiver side of the machines' phase event channel, taken by `start`
    phase_rx: Mutex<Option<mpsc::UnboundedReceiver<PhaseEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SessionOrchestrator {
    /// Create an orchestrator with a freshly minted local id.
    pub fn new(
        role: Role,
        config: OrchestratorConfig,
        channel: Arc<dyn SignalingChannel>,
    ) -> Result<Self> {
        Self::with_local_id(ParticipantId::mint(role), config, channel)
    }

    /// Create an orchestrator for an existing identity.
    ///
    /// The role is the one encoded in `local_id`, which keeps a reconnecting
    /// endpoint recognizable across process restarts.
    #[instrument(skip_all, fields(local_id = %local_id))]
    pub fn with_local_id(
        local_id: ParticipantId,
        config: OrchestratorConfig,
        channel: Arc<dyn SignalingChannel>,
    ) -> Result<Self> {
        config.validate()?;
        let role = local_id.role();

        let (observers, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let watchers: WatcherMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let health = HealthMonitor::new(config.health.clone(), observers.clone());

        // The factory wires each new machine into the health monitor as a
        // side effect, so routed-in participants are watched from creation.
        let factory: MachineFactory = {
            let local_id = local_id.clone();
            let config = config.clone();
            let channel = channel.clone();
            let observers = observers.clone();
            let watchers = watchers.clone();
            Arc::new(move |participant_id: ParticipantId| {
                let machine = ConnectionMachine::new(
                    local_id.clone(),
                    participant_id.clone(),
                    role,
                    config.clone(),
                    channel.clone(),
                    events_tx.clone(),
                    observers.clone(),
                );
                let handle = health.watch(&machine);
                if let Ok(mut watchers) = watchers.lock() {
                    // Replacing an entry drops the old handle, which stops
                    // the superseded watch task.
                    watchers.insert(participant_id, handle);
                }
                machine
            })
        };

        let registry = Arc::new(ConnectionRegistry::new(
            config.max_participants,
            factory,
            observers.clone(),
        ));
        let controller = Arc::new(ReconnectController::new(
            config.reconnect.clone(),
            role,
            observers.clone(),
        ));

        info!("Created session orchestrator for {} ({})", local_id, role);

        Ok(Self {
            local_id,
            role,
            config,
            channel,
            registry,
            controller,
            observers,
            watchers,
            phase_rx: Mutex::new(Some(events_rx)),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Id of this endpoint
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Role of this endpoint
    pub fn role(&self) -> Role {
        self.role
    }

    /// Configuration the orchestrator was built with
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Subscribe to the observer event stream.
    ///
    /// Pure telemetry: a lagging or dropped subscriber never affects
    /// orchestration.
    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.observers.subscribe()
    }

    /// Spawn the dispatch, phase and channel-status loops.
    ///
    /// Idempotent; the loops run until [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Orchestrator for {} already started", self.local_id);
            return Ok(());
        }

        info!("Starting session orchestrator for {}", self.local_id);

        let phase_rx = {
            let mut slot = self.phase_rx.lock().await;
            slot.take().ok_or_else(|| {
                Error::SessionError("phase event receiver already consumed".to_string())
            })?
        };

        let mut tasks = Vec::with_capacity(3);
        tasks.push(self.spawn_dispatch_loop());
        tasks.push(self.spawn_phase_loop(phase_rx));
        tasks.push(self.spawn_status_loop());

        if let Ok(mut slot) = self.tasks.lock() {
            slot.extend(tasks);
        }

        Ok(())
    }

    /// Announce this endpoint and open its leg toward the host.
    ///
    /// Participant endpoints only; the host side answers inbound offers
    /// instead of initiating.
    pub async fn join(&self) -> Result<()> {
        if self.role != Role::Participant {
            return Err(Error::SessionError(
                "join is a participant-side operation; the host answers inbound offers"
                    .to_string(),
            ));
        }

        self.channel
            .send(SignalMessage::join(self.local_id.clone(), self.role))
            .await?;

        let machine = self.registry.ensure_machine(&self.local_id).await?;
        machine.start_offer().await
    }

    /// Store local media for this endpoint's leg.
    ///
    /// Tracks are bound into the transceiver slots as soon as the transport
    /// exists and rebind automatically across transport rebuilds.
    pub async fn bind_local_media(&self, tracks: MediaTrackSet) -> Result<()> {
        if self.role != Role::Participant {
            return Err(Error::SessionError(
                "host endpoint receives media; nothing to bind".to_string(),
            ));
        }
        let machine = self.registry.ensure_machine(&self.local_id).await?;
        machine.bind_local_tracks(tracks).await
    }

    /// Leave the session: announce, then tear down the local leg.
    pub async fn leave(&self) -> Result<()> {
        if self.role != Role::Participant {
            return Err(Error::SessionError(
                "host endpoint does not leave; use shutdown".to_string(),
            ));
        }
        if let Err(e) = self
            .channel
            .send(SignalMessage::leave(self.local_id.clone()))
            .await
        {
            warn!("Leave announcement for {} not delivered: {}", self.local_id, e);
        }
        self.remove_participant(&self.local_id).await
    }

    /// Host-side eviction: announce the removal and tear down the leg.
    pub async fn remove_participant(&self, participant_id: &ParticipantId) -> Result<()> {
        if self.role == Role::Host {
            if let Err(e) = self
                .channel
                .send(SignalMessage::leave(participant_id.clone()))
                .await
            {
                warn!(
                    "Leave announcement for {} not delivered: {}",
                    participant_id, e
                );
            }
        }
        self.controller.cancel(participant_id).await;
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.remove(participant_id);
        }
        self.registry.remove(participant_id).await
    }

    /// Machine for one participant leg
    pub async fn participant(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Arc<ConnectionMachine>> {
        self.registry.get(participant_id).await
    }

    /// Snapshot descriptors for every leg
    pub async fn list(&self) -> Vec<ConnectionDescriptor> {
        self.registry.list().await
    }

    /// Session-wide status, derived on demand
    pub async fn status(&self) -> AggregateStatus {
        self.registry.aggregate_status(self.channel.status()).await
    }

    /// Manually trigger recovery for a participant.
    ///
    /// Resets the retry budget and the exhaustion latch; returns whether an
    /// attempt actually started.
    pub async fn force_reconnect(&self, participant_id: &ParticipantId) -> Result<bool> {
        let machine = self.registry.get(participant_id).await?;
        self.controller.force_reconnect(&machine).await
    }

    /// Stop the loops and tear down every connection. Idempotent.
    pub async fn shutdown(&self) {
        info!("Shutting down session orchestrator for {}", self.local_id);
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut slot) => slot.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }

        self.controller.cancel_all().await;

        let watchers: Vec<HealthHandle> = match self.watchers.lock() {
            Ok(mut map) => map.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };
        futures::future::join_all(watchers.iter().map(|handle| handle.cancel())).await;

        self.registry.close_all().await;
        self.started.store(false, Ordering::SeqCst);
    }

    /// Inbound dispatch: routes channel messages through the registry in
    /// arrival order.
    fn spawn_dispatch_loop(&self) -> JoinHandle<()> {
        let mut inbox = self.channel.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let registry = self.registry.clone();
        let local_id = self.local_id.clone();
        let role = self.role;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = inbox.recv() => match result {
                        Ok(message) => {
                            Self::dispatch(&registry, &local_id, role, message).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            warn!("Signaling inbox lagged, {} message(s) lost", count);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Dispatch loop for {} stopped", local_id);
        })
    }

    async fn dispatch(
        registry: &ConnectionRegistry,
        local_id: &ParticipantId,
        role: Role,
        message: SignalMessage,
    ) {
        // The host handles every participant leg; a participant endpoint
        // only handles traffic addressed with its own id.
        let relevant = match role {
            Role::Host => message.participant_id != *local_id,
            Role::Participant => message.participant_id == *local_id,
        };
        if !relevant {
            debug!(
                "Ignoring {} message addressed to {}",
                message.event, message.participant_id
            );
            return;
        }

        let event = message.event;
        let participant_id = message.participant_id.clone();
        if let Err(e) = registry.route(message).await {
            // Component-local failures stop here; only phase-level failures
            // travel, via the machines' phase event channel.
            warn!(
                "Dropped {} message for {}: {}",
                event, participant_id, e
            );
        }
    }

    /// Phase events feed the reconnection controller.
    fn spawn_phase_loop(
        &self,
        mut phase_rx: mpsc::UnboundedReceiver<PhaseEvent>,
    ) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        let registry = self.registry.clone();
        let controller = self.controller.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = phase_rx.recv() => match event {
                        Some(event) => {
                            match registry.get(&event.participant_id).await {
                                Ok(machine) => {
                                    controller.handle_phase_event(&machine, &event).await;
                                }
                                Err(_) => debug!(
                                    "Phase event for removed participant {} ignored",
                                    event.participant_id
                                ),
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Phase event loop stopped");
        })
    }

    /// Channel status changes surface as observer events.
    fn spawn_status_loop(&self) -> JoinHandle<()> {
        let mut status_rx = self.channel.watch_status();
        let mut shutdown = self.shutdown.subscribe();
        let observers = self.observers.clone();

        tokio::spawn(async move {
            let mut last = *status_rx.borrow();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *status_rx.borrow_and_update();
                        if status != last {
                            info!("Signaling link status: {} -> {}", last, status);
                            let _ = observers.send(OrchestratorEvent::SignalingStatusChanged {
                                status,
                            });
                            last = status;
                        }
                    }
                }
            }
            debug!("Channel status loop stopped");
        })
    }
}
