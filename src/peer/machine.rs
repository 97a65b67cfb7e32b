//! Per-participant connection state machine.
//!
//! One [`ConnectionMachine`] owns everything for a single participant leg:
//! the `RTCPeerConnection`, its media slot set, the ICE candidate buffer,
//! and the lifecycle phase. All mutation funnels through a single async
//! mutex, so operations apply in the order they arrive regardless of which
//! task delivers them.
//!
//! WebRTC callbacks never touch machine state directly. They forward
//! signals, tagged with the negotiation generation they were installed
//! under, into an internal queue drained by a dedicated task. Signals from
//! a superseded generation are dropped, which keeps late callbacks from a
//! torn-down transport from corrupting a newer attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::events::OrchestratorEvent;
use crate::health::HealthSample;
use crate::ice::CandidateBuffer;
use crate::media::{MediaKind, MediaRelay, MediaTrackSet, SlotSet, TrackReceivedCallback};
use crate::participant::{ParticipantId, Role};
use crate::peer::phase::{ConnectionPhase, NegotiationDirection, PhaseEvent};
use crate::signaling::{
    current_timestamp_ms, CandidatePayload, DescriptionPayload, SignalEvent, SignalMessage,
    SignalingChannel,
};

/// Point-in-time snapshot of one participant leg.
///
/// Returned by [`ConnectionMachine::descriptor`] and the registry's `list`;
/// a copy, not a live view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub participant_id: ParticipantId,
    pub role: Role,
    pub phase: ConnectionPhase,
    pub generation: u64,
    /// Epoch milliseconds at machine creation
    pub created_at_ms: u64,
}

/// Signal forwarded from a WebRTC callback into the machine's drain loop.
enum MachineSignal {
    TransportState {
        state: RTCPeerConnectionState,
        generation: u64,
    },
    LocalCandidate {
        payload: CandidatePayload,
        generation: u64,
    },
    RemoteTrack {
        track: Arc<TrackRemote>,
        generation: u64,
    },
}

impl MachineSignal {
    fn generation(&self) -> u64 {
        match self {
            Self::TransportState { generation, .. }
            | Self::LocalCandidate { generation, .. }
            | Self::RemoteTrack { generation, .. } => *generation,
        }
    }
}

/// State guarded by the machine's mutex.
struct MachineInner {
    phase: ConnectionPhase,
    pc: Option<Arc<RTCPeerConnection>>,
    slots: Option<SlotSet>,
    buffer: CandidateBuffer,
    /// Local tracks to bind, kept across transport rebuilds.
    local_tracks: MediaTrackSet,
    /// At least one local track bound or remote track received.
    media_live: bool,
    /// Transport-level connected signal seen for the current attempt.
    transport_connected: bool,
    last_activity: Instant,
}

/// Connection state machine for one participant leg.
///
/// Created by the registry when a participant joins (or when the first
/// message for an unknown participant arrives). The machine starts in
/// [`ConnectionPhase::Idle`] with no transport; `start_offer` or an
/// incoming offer builds one.
pub struct ConnectionMachine {
    local_id: ParticipantId,
    participant_id: ParticipantId,
    role: Role,
    config: OrchestratorConfig,
    channel: Arc<dyn SignalingChannel>,
    inner: Mutex<MachineInner>,
    phase_tx: watch::Sender<ConnectionPhase>,
    /// Bumped on every reconnect and on close; callbacks installed under
    /// an older generation are ignored.
    generation: AtomicU64,
    signals: mpsc::UnboundedSender<MachineSignal>,
    events: mpsc::UnboundedSender<PhaseEvent>,
    observers: broadcast::Sender<OrchestratorEvent>,
    track_callback: std::sync::Mutex<Option<TrackReceivedCallback>>,
    created_at_ms: u64,
}

impl ConnectionMachine {
    /// Create a machine in `idle` and spawn its signal drain loop.
    ///
    /// Must be called from within a Tokio runtime. `local_id` is the id of
    /// this endpoint, `participant_id` the participant leg the machine
    /// manages; on a participant endpoint the two are the same.
    #[instrument(skip_all, fields(participant_id = %participant_id, role = %role))]
    pub fn new(
        local_id: ParticipantId,
        participant_id: ParticipantId,
        role: Role,
        config: OrchestratorConfig,
        channel: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<PhaseEvent>,
        observers: broadcast::Sender<OrchestratorEvent>,
    ) -> Arc<Self> {
        let buffer = CandidateBuffer::new(local_id.clone(), participant_id.clone());
        let (phase_tx, _) = watch::channel(ConnectionPhase::Idle);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

        debug!(
            "Created connection machine for participant {} (local {}, role {})",
            participant_id, local_id, role
        );

        let machine = Arc::new(Self {
            local_id,
            participant_id,
            role,
            config,
            channel,
            inner: Mutex::new(MachineInner {
                phase: ConnectionPhase::Idle,
                pc: None,
                slots: None,
                buffer,
                local_tracks: MediaTrackSet::default(),
                media_live: false,
                transport_connected: false,
                last_activity: Instant::now(),
            }),
            phase_tx,
            generation: AtomicU64::new(0),
            signals: signal_tx,
            events,
            observers,
            track_callback: std::sync::Mutex::new(None),
            created_at_ms: current_timestamp_ms(),
        });

        // Drain loop: applies callback signals in arrival order. Exits when
        // the machine is dropped (sender side closes the channel).
        let weak = Arc::downgrade(&machine);
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                match weak.upgrade() {
                    Some(machine) => machine.apply_signal(signal).await,
                    None => break,
                }
            }
        });

        machine
    }

    /// Participant leg this machine manages
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Id of the local endpoint
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Role of the local endpoint
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase_tx.borrow()
    }

    /// Watch phase transitions as they happen
    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_tx.subscribe()
    }

    /// Current negotiation generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Counts of (outbound, inbound) ICE candidates currently buffered
    pub async fn buffered_candidates(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        inner.buffer.pending()
    }

    /// Snapshot of this leg's identity and lifecycle state
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            participant_id: self.participant_id.clone(),
            role: self.role,
            phase: self.phase(),
            generation: self.generation(),
            created_at_ms: self.created_at_ms,
        }
    }

    // ========== Negotiation entry points ==========

    /// Build the transport and send the initial offer.
    ///
    /// Only valid in `idle`; reconnection attempts go through
    /// [`begin_reconnect`](Self::begin_reconnect) instead.
    pub async fn start_offer(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase != ConnectionPhase::Idle {
            return Err(Error::InvalidTransition {
                from: inner.phase,
                to: ConnectionPhase::Signaling(NegotiationDirection::Offering),
            });
        }

        info!(
            "Participant {} starting negotiation as offerer",
            self.participant_id
        );
        self.open_transport(&mut inner).await?;
        self.transition(
            &mut inner,
            ConnectionPhase::Signaling(NegotiationDirection::Offering),
        )?;
        self.send_local_offer(&mut inner, false).await
    }

    /// Route an inbound signaling message to the matching handler.
    pub async fn handle_signal(&self, message: SignalMessage) -> Result<()> {
        match message.event {
            SignalEvent::Offer => self.handle_offer(message.description()?).await,
            SignalEvent::Answer => self.handle_answer(message.description()?).await,
            SignalEvent::IceCandidate => self.handle_candidate(message.candidate()?).await,
            SignalEvent::Join | SignalEvent::Leave => {
                debug!(
                    "Participant {} membership message ignored by machine",
                    self.participant_id
                );
                Ok(())
            }
        }
    }

    /// Apply a remote offer.
    ///
    /// Dispatch depends on the current phase: `idle` answers fresh,
    /// mid-negotiation phases drop the offer, live phases renegotiate in
    /// place, `failed` treats it as a recovery offer.
    pub async fn handle_offer(&self, payload: DescriptionPayload) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            ConnectionPhase::Idle => {
                info!(
                    "Participant {} answering incoming offer",
                    self.participant_id
                );
                self.open_transport(&mut inner).await?;
                if !self.answer_offer(&mut inner, payload).await? {
                    self.teardown_transport(&mut inner).await;
                }
                Ok(())
            }
            ConnectionPhase::Signaling(_) | ConnectionPhase::IceNegotiating => {
                warn!(
                    "Participant {} dropping offer received mid-negotiation in phase {}",
                    self.participant_id, inner.phase
                );
                Ok(())
            }
            ConnectionPhase::Connected | ConnectionPhase::Degraded => {
                info!("Participant {} renegotiating in place", self.participant_id);
                self.renegotiate(&mut inner, payload).await
            }
            ConnectionPhase::Failed => {
                info!(
                    "Participant {} answering recovery offer after failure",
                    self.participant_id
                );
                self.prepare_restart(&mut inner).await?;
                self.answer_offer(&mut inner, payload).await?;
                Ok(())
            }
            ConnectionPhase::Closed => {
                warn!(
                    "Participant {} dropping offer received after close",
                    self.participant_id
                );
                Ok(())
            }
        }
    }

    /// Apply a remote answer to a pending local offer.
    ///
    /// Answers arriving in any phase other than `signaling(offering)` are
    /// stale or duplicated and are dropped with a warning.
    pub async fn handle_answer(&self, payload: DescriptionPayload) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase != ConnectionPhase::Signaling(NegotiationDirection::Offering) {
            warn!(
                "Participant {} dropping answer received in phase {}",
                self.participant_id, inner.phase
            );
            return Ok(());
        }

        let pc = self.require_transport(&inner)?;
        let answer = match RTCSessionDescription::answer(payload.sdp) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(
                    "Participant {} dropping malformed answer: {}",
                    self.participant_id, e
                );
                return Ok(());
            }
        };
        if let Err(e) = pc.set_remote_description(answer).await {
            warn!(
                "Participant {} dropping unusable answer: {}",
                self.participant_id, e
            );
            return Ok(());
        }

        self.transition(&mut inner, ConnectionPhase::IceNegotiating)?;
        self.flush_candidates(&mut inner).await;
        self.try_mark_connected(&mut inner);
        Ok(())
    }

    /// Apply or buffer a remote ICE candidate.
    ///
    /// Candidates arriving before the remote description is set are
    /// buffered; candidates the transport rejects are logged and dropped.
    pub async fn handle_candidate(&self, payload: CandidatePayload) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase == ConnectionPhase::Closed {
            debug!(
                "Participant {} dropping candidate received after close",
                self.participant_id
            );
            return Ok(());
        }

        if let Some(ready) = inner.buffer.buffer_inbound(payload) {
            let Some(pc) = inner.pc.clone() else {
                warn!(
                    "Participant {} dropping candidate arriving with no active transport",
                    self.participant_id
                );
                return Ok(());
            };
            if let Err(e) = pc.add_ice_candidate(ready.into_init()).await {
                warn!(
                    "Participant {} discarding invalid ICE candidate: {}",
                    self.participant_id, e
                );
            }
        }
        Ok(())
    }

    // ========== Media ==========

    /// Store local tracks and bind them to allocated slots.
    ///
    /// Tracks survive transport rebuilds: after a reconnect reallocates the
    /// slot set, the stored tracks are bound again automatically. Binding
    /// before the transport exists just stores them.
    pub async fn bind_local_tracks(&self, tracks: MediaTrackSet) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.local_tracks = tracks;
        if inner.slots.is_none() {
            debug!(
                "Participant {} stored local tracks for later binding",
                self.participant_id
            );
            return Ok(());
        }
        self.bind_stored_tracks(&mut inner).await
    }

    /// Record that media recently flowed on this connection.
    ///
    /// Consumers reading RTP from remote tracks (or pushing samples into
    /// local ones) call this to feed the health monitor's freshness check.
    pub async fn record_media_activity(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Instant::now();
    }

    // ========== Health and recovery ==========

    /// Point-in-time health reading for the health monitor.
    pub async fn health_snapshot(&self) -> HealthSample {
        let inner = self.inner.lock().await;
        let transport_active = inner
            .pc
            .as_ref()
            .map(|pc| pc.connection_state() == RTCPeerConnectionState::Connected)
            .unwrap_or(false);
        let track_present = match inner.slots.as_ref() {
            _ if inner.media_live => true,
            Some(slots) => slots.any_track_bound().await,
            None => false,
        };
        HealthSample {
            phase: inner.phase,
            transport_active,
            track_present,
            last_activity_age_ms: inner.last_activity.elapsed().as_millis() as u64,
        }
    }

    /// Downgrade a `connected` machine to `degraded`.
    ///
    /// Returns whether the transition happened.
    pub async fn mark_degraded(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.phase != ConnectionPhase::Connected {
            return false;
        }
        warn!("Participant {} degraded: {}", self.participant_id, reason);
        self.transition(&mut inner, ConnectionPhase::Degraded).is_ok()
    }

    /// Restore a `degraded` machine to `connected`.
    ///
    /// Returns whether the transition happened.
    pub async fn mark_recovered(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.phase != ConnectionPhase::Degraded {
            return false;
        }
        info!(
            "Participant {} recovered to connected",
            self.participant_id
        );
        self.transition(&mut inner, ConnectionPhase::Connected).is_ok()
    }

    /// Force the machine into `failed` from any live phase.
    pub async fn mark_failed(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        self.fail(&mut inner, reason);
    }

    /// Start a recovery negotiation from `degraded` or `failed`.
    ///
    /// Bumps the generation, resets the candidate buffer and either
    /// restarts ICE on the existing transport or rebuilds it from scratch
    /// when it is beyond salvage, then re-enters signaling as the offerer.
    /// Returns `Ok(false)` when the machine is not in a recoverable phase
    /// and nothing was done.
    pub async fn begin_reconnect(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            ConnectionPhase::Degraded | ConnectionPhase::Failed => {}
            other => {
                warn!(
                    "Participant {} reconnect requested in phase {}; ignoring",
                    self.participant_id, other
                );
                return Ok(false);
            }
        }

        let reused = self.prepare_restart(&mut inner).await?;
        self.transition(
            &mut inner,
            ConnectionPhase::Signaling(NegotiationDirection::Offering),
        )?;
        self.send_local_offer(&mut inner, reused).await?;
        Ok(true)
    }

    /// Tear the connection down. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase == ConnectionPhase::Closed {
            debug!("Participant {} already closed", self.participant_id);
            return Ok(());
        }

        info!("Closing connection for participant {}", self.participant_id);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transition(&mut inner, ConnectionPhase::Closed)?;
        inner.buffer.reset();
        self.teardown_transport(&mut inner).await;
        Ok(())
    }

    // ========== Internals ==========

    /// Validate and apply a phase transition, emitting events.
    fn transition(&self, inner: &mut MachineInner, to: ConnectionPhase) -> Result<()> {
        let from = inner.phase;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        debug!(
            "Participant {} phase transition: {} -> {}",
            self.participant_id, from, to
        );
        inner.phase = to;
        self.phase_tx.send_replace(to);

        let generation = self.generation.load(Ordering::SeqCst);
        let _ = self.events.send(PhaseEvent::new(
            self.participant_id.clone(),
            from,
            to,
            generation,
        ));
        let _ = self.observers.send(OrchestratorEvent::PhaseChanged {
            participant_id: self.participant_id.clone(),
            from,
            to,
            generation,
        });
        Ok(())
    }

    /// Move to `failed` unless already failed or closed.
    fn fail(&self, inner: &mut MachineInner, reason: &str) {
        if matches!(
            inner.phase,
            ConnectionPhase::Failed | ConnectionPhase::Closed
        ) {
            return;
        }
        warn!(
            "Participant {} connection failed: {}",
            self.participant_id, reason
        );
        if let Err(e) = self.transition(inner, ConnectionPhase::Failed) {
            warn!("Participant {}: {}", self.participant_id, e);
        }
    }

    /// Promote to `connected` once both the transport signal and live
    /// media have been seen.
    fn try_mark_connected(&self, inner: &mut MachineInner) {
        if inner.phase == ConnectionPhase::IceNegotiating
            && inner.transport_connected
            && inner.media_live
        {
            if let Err(e) = self.transition(inner, ConnectionPhase::Connected) {
                warn!("Participant {}: {}", self.participant_id, e);
            } else {
                info!(
                    "Participant {} connection established",
                    self.participant_id
                );
            }
        }
    }

    /// Map a failed local negotiation step into `failed` plus an error.
    fn local_step<T, E: std::fmt::Display>(
        &self,
        inner: &mut MachineInner,
        result: std::result::Result<T, E>,
        context: &str,
    ) -> Result<T> {
        result.map_err(|e| {
            let error = Error::SdpError(format!("{}: {}", context, e));
            self.fail(inner, &error.to_string());
            error
        })
    }

    fn require_transport(&self, inner: &MachineInner) -> Result<Arc<RTCPeerConnection>> {
        inner.pc.clone().ok_or_else(|| {
            Error::PeerConnectionError(format!(
                "No active peer connection for participant {}",
                self.participant_id
            ))
        })
    }

    /// Build the WebRTC peer connection from the configured ICE servers.
    #[allow(clippy::needless_update)]
    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);
        Ok(pc)
    }

    /// Forward transport callbacks into the drain loop under `generation`.
    fn install_callbacks(&self, pc: &RTCPeerConnection, generation: u64) {
        let signals = self.signals.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let signals = signals.clone();
            Box::pin(async move {
                let _ = signals.send(MachineSignal::TransportState { state, generation });
            })
        }));

        let signals = self.signals.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let signals = signals.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = signals.send(MachineSignal::LocalCandidate {
                                payload: CandidatePayload::from_init(init),
                                generation,
                            });
                        }
                        Err(e) => {
                            debug!("Skipping unserializable local candidate: {}", e);
                        }
                    }
                }
            })
        }));

        let signals = self.signals.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let signals = signals.clone();
            Box::pin(async move {
                let _ = signals.send(MachineSignal::RemoteTrack { track, generation });
            })
        }));
    }

    /// Build transport, install callbacks, allocate slots, bind tracks.
    async fn open_transport(&self, inner: &mut MachineInner) -> Result<()> {
        let pc = self.build_peer_connection().await?;
        self.install_callbacks(&pc, self.generation.load(Ordering::SeqCst));
        let slots = SlotSet::allocate(&pc, self.role).await?;
        inner.pc = Some(pc);
        inner.slots = Some(slots);
        self.bind_stored_tracks(inner).await
    }

    /// Close and drop the transport; phase is left untouched.
    async fn teardown_transport(&self, inner: &mut MachineInner) {
        if let Some(mut slots) = inner.slots.take() {
            slots.release();
        }
        if let Some(pc) = inner.pc.take() {
            if let Err(e) = pc.close().await {
                warn!(
                    "Participant {} error closing peer connection: {}",
                    self.participant_id, e
                );
            }
        }
        inner.transport_connected = false;
        inner.media_live = false;
    }

    /// Bind stored local tracks to their slots.
    async fn bind_stored_tracks(&self, inner: &mut MachineInner) -> Result<()> {
        let mut bound = 0usize;
        if let Some(slots) = inner.slots.as_ref() {
            for kind in slots.kinds() {
                if let Some(track) = inner.local_tracks.track_for(kind) {
                    slots.bind_track(kind, track).await?;
                    bound += 1;
                }
            }
        }
        if bound > 0 {
            inner.media_live = true;
            inner.last_activity = Instant::now();
            debug!(
                "Participant {} bound {} local track(s)",
                self.participant_id, bound
            );
            self.try_mark_connected(inner);
        }
        Ok(())
    }

    /// Reset negotiation state for a recovery attempt.
    ///
    /// Returns whether the existing transport was kept. A transport whose
    /// connection state is `failed` or `closed` is beyond salvage and gets
    /// rebuilt; otherwise ICE is restarted on it.
    async fn prepare_restart(&self, inner: &mut MachineInner) -> Result<bool> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.buffer.reset();

        let reusable = inner
            .pc
            .as_ref()
            .map(|pc| {
                !matches!(
                    pc.connection_state(),
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                )
            })
            .unwrap_or(false);

        if reusable {
            if let Some(pc) = inner.pc.clone() {
                // Re-key callbacks so queued signals from the previous
                // attempt are discarded by the generation check.
                self.install_callbacks(&pc, generation);
                inner.transport_connected =
                    pc.connection_state() == RTCPeerConnectionState::Connected;
            }
            info!(
                "Participant {} restarting ICE on existing transport (generation {})",
                self.participant_id, generation
            );
        } else {
            self.teardown_transport(inner).await;
            self.open_transport(inner).await?;
            info!(
                "Participant {} rebuilt transport for recovery (generation {})",
                self.participant_id, generation
            );
        }
        Ok(reusable)
    }

    /// Create, apply and send a local offer.
    async fn send_local_offer(&self, inner: &mut MachineInner, ice_restart: bool) -> Result<()> {
        let pc = self.require_transport(inner)?;
        let options = if ice_restart {
            Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            })
        } else {
            None
        };

        let offer = self.local_step(inner, pc.create_offer(options).await, "Failed to create offer")?;
        self.local_step(
            inner,
            pc.set_local_description(offer.clone()).await,
            "Failed to set local description",
        )?;

        let message = SignalMessage::offer(self.participant_id.clone(), offer.sdp);
        if let Err(e) = self.channel.send(message).await {
            self.fail(inner, &e.to_string());
            return Err(e);
        }
        debug!(
            "Participant {} offer sent (ice_restart: {})",
            self.participant_id, ice_restart
        );
        Ok(())
    }

    /// Apply a remote offer and produce an answer on a fresh negotiation.
    ///
    /// Returns `Ok(false)` when the offer was malformed and dropped, in
    /// which case no phase transition happened.
    async fn answer_offer(
        &self,
        inner: &mut MachineInner,
        payload: DescriptionPayload,
    ) -> Result<bool> {
        let pc = self.require_transport(inner)?;

        let offer = match RTCSessionDescription::offer(payload.sdp) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(
                    "Participant {} dropping malformed offer: {}",
                    self.participant_id, e
                );
                return Ok(false);
            }
        };
        if let Err(e) = pc.set_remote_description(offer).await {
            warn!(
                "Participant {} dropping unusable offer: {}",
                self.participant_id, e
            );
            return Ok(false);
        }

        self.transition(
            inner,
            ConnectionPhase::Signaling(NegotiationDirection::Answering),
        )?;

        let answer =
            self.local_step(inner, pc.create_answer(None).await, "Failed to create answer")?;
        self.local_step(
            inner,
            pc.set_local_description(answer.clone()).await,
            "Failed to set local description",
        )?;

        let message = SignalMessage::answer(self.participant_id.clone(), answer.sdp);
        if let Err(e) = self.channel.send(message).await {
            self.fail(inner, &e.to_string());
            return Err(e);
        }

        self.transition(inner, ConnectionPhase::IceNegotiating)?;
        self.flush_candidates(inner).await;
        self.try_mark_connected(inner);
        Ok(true)
    }

    /// Answer a renegotiation offer on a live connection.
    ///
    /// The phase is left untouched; the fixed slot set is validated after
    /// the exchange and an order violation tears the transport down.
    async fn renegotiate(&self, inner: &mut MachineInner, payload: DescriptionPayload) -> Result<()> {
        let pc = self.require_transport(inner)?;

        let offer = match RTCSessionDescription::offer(payload.sdp) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(
                    "Participant {} dropping malformed renegotiation offer: {}",
                    self.participant_id, e
                );
                return Ok(());
            }
        };
        if let Err(e) = pc.set_remote_description(offer).await {
            warn!(
                "Participant {} dropping unusable renegotiation offer: {}",
                self.participant_id, e
            );
            return Ok(());
        }

        let answer =
            self.local_step(inner, pc.create_answer(None).await, "Failed to create answer")?;
        self.local_step(
            inner,
            pc.set_local_description(answer.clone()).await,
            "Failed to set local description",
        )?;

        let message = SignalMessage::answer(self.participant_id.clone(), answer.sdp);
        if let Err(e) = self.channel.send(message).await {
            self.fail(inner, &e.to_string());
            return Err(e);
        }

        let order_intact = match inner.slots.as_ref() {
            Some(slots) => slots.validate_order(&pc).await,
            None => false,
        };
        if !order_intact {
            let error = Error::TransceiverIntegrityError(format!(
                "Transceiver order changed during renegotiation for participant {}",
                self.participant_id
            ));
            self.fail(inner, &error.to_string());
            self.teardown_transport(inner).await;
            return Err(error);
        }

        debug!(
            "Participant {} renegotiation complete in phase {}",
            self.participant_id, inner.phase
        );
        Ok(())
    }

    /// Drain the candidate buffer after the remote description applies.
    ///
    /// Buffered remote candidates apply to the transport first, then
    /// buffered local candidates go out through signaling. Individual
    /// candidate failures are logged and skipped.
    async fn flush_candidates(&self, inner: &mut MachineInner) {
        let flushed = inner.buffer.mark_negotiation_ready();
        if flushed.is_empty() {
            return;
        }

        if let Some(pc) = inner.pc.clone() {
            for buffered in flushed.inbound {
                if let Err(e) = pc.add_ice_candidate(buffered.payload.into_init()).await {
                    warn!(
                        "Participant {} discarding invalid buffered ICE candidate: {}",
                        self.participant_id, e
                    );
                }
            }
        }
        for buffered in flushed.outbound {
            self.send_candidate(buffered.payload).await;
        }
    }

    async fn send_candidate(&self, payload: CandidatePayload) {
        let message = SignalMessage::ice_candidate(self.participant_id.clone(), payload);
        if let Err(e) = self.channel.send(message).await {
            warn!(
                "Participant {} failed to send ICE candidate: {}",
                self.participant_id, e
            );
        }
    }

    /// Apply one signal from the drain loop, discarding stale generations.
    async fn apply_signal(&self, signal: MachineSignal) {
        let current = self.generation.load(Ordering::SeqCst);
        if signal.generation() != current {
            debug!(
                "Participant {} dropping signal from superseded generation {} (current {})",
                self.participant_id,
                signal.generation(),
                current
            );
            return;
        }

        match signal {
            MachineSignal::TransportState { state, .. } => {
                self.handle_transport_state(state).await;
            }
            MachineSignal::LocalCandidate { payload, .. } => {
                self.handle_local_candidate(payload).await;
            }
            MachineSignal::RemoteTrack { track, .. } => {
                self.handle_remote_track(track).await;
            }
        }
    }

    async fn handle_transport_state(&self, state: RTCPeerConnectionState) {
        let mut inner = self.inner.lock().await;
        match state {
            RTCPeerConnectionState::Connected => {
                inner.transport_connected = true;
                inner.last_activity = Instant::now();
                self.try_mark_connected(&mut inner);
            }
            RTCPeerConnectionState::Disconnected => {
                inner.transport_connected = false;
                warn!(
                    "Participant {} transport disconnected",
                    self.participant_id
                );
            }
            RTCPeerConnectionState::Failed => {
                inner.transport_connected = false;
                self.fail(&mut inner, "transport reported terminal failure");
            }
            _ => {}
        }
    }

    async fn handle_local_candidate(&self, payload: CandidatePayload) {
        let mut inner = self.inner.lock().await;
        if let Some(ready) = inner.buffer.buffer_outbound(payload) {
            drop(inner);
            self.send_candidate(ready).await;
        }
    }

    /// Set the phase directly, bypassing transition validation.
    #[cfg(test)]
    pub(crate) async fn force_phase(&self, phase: ConnectionPhase) {
        let mut inner = self.inner.lock().await;
        inner.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    /// Drop the transport without a phase change, bypassing lifecycle.
    #[cfg(test)]
    pub(crate) async fn force_teardown(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown_transport(&mut inner).await;
    }

    async fn handle_remote_track(&self, track: Arc<TrackRemote>) {
        let kind = match track.kind() {
            RTPCodecType::Video => Some(MediaKind::Video),
            RTPCodecType::Audio => Some(MediaKind::Audio),
            _ => None,
        };
        info!(
            "Participant {} received remote {} track",
            self.participant_id,
            kind.map(|k| k.as_str()).unwrap_or("unknown")
        );

        let mut inner = self.inner.lock().await;
        inner.media_live = true;
        inner.last_activity = Instant::now();
        self.try_mark_connected(&mut inner);
        drop(inner);

        let _ = self.observers.send(OrchestratorEvent::TrackReceived {
            participant_id: self.participant_id.clone(),
            kind,
        });

        let callback = match self.track_callback.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(track);
        }
    }
}

#[async_trait]
impl MediaRelay for ConnectionMachine {
    async fn send_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            RTPCodecType::Audio => MediaKind::Audio,
            _ => {
                return Err(Error::MediaTrackError(
                    "Track has an unspecified codec type".to_string(),
                ))
            }
        };

        let mut inner = self.inner.lock().await;
        match kind {
            MediaKind::Video => inner.local_tracks.video = Some(track),
            MediaKind::Audio => inner.local_tracks.audio = Some(track),
        }
        if inner.slots.is_none() {
            debug!(
                "Participant {} stored {} track for later binding",
                self.participant_id, kind
            );
            return Ok(());
        }
        self.bind_stored_tracks(&mut inner).await
    }

    fn on_track_received(&self, callback: TrackReceivedCallback) {
        if let Ok(mut slot) = self.track_callback.lock() {
            *slot = Some(callback);
        }
    }

    fn connection_phase(&self) -> ConnectionPhase {
        *self.phase_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use crate::media::{MediaSource, StaticMediaSource};
    use crate::signaling::InMemorySignaling;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    struct TestEndpoints {
        participant: Arc<ConnectionMachine>,
        host: Arc<ConnectionMachine>,
        participant_channel: Arc<InMemorySignaling>,
        host_channel: Arc<InMemorySignaling>,
        events_rx: mpsc::UnboundedReceiver<PhaseEvent>,
    }

    fn endpoints() -> TestEndpoints {
        let (participant_channel, host_channel) = InMemorySignaling::pair();
        let config = OrchestratorConfig::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (observers_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let participant_id = ParticipantId::mint(Role::Participant);
        let host_id = ParticipantId::mint(Role::Host);

        let participant = ConnectionMachine::new(
            participant_id.clone(),
            participant_id.clone(),
            Role::Participant,
            config.clone(),
            participant_channel.clone() as Arc<dyn SignalingChannel>,
            events_tx.clone(),
            observers_tx.clone(),
        );
        let host = ConnectionMachine::new(
            host_id,
            participant_id,
            Role::Host,
            config,
            host_channel.clone() as Arc<dyn SignalingChannel>,
            events_tx,
            observers_tx,
        );

        TestEndpoints {
            participant,
            host,
            participant_channel,
            host_channel,
            events_rx,
        }
    }

    async fn next_message(
        rx: &mut broadcast::Receiver<SignalMessage>,
        event: SignalEvent,
    ) -> SignalMessage {
        loop {
            let message = timeout(RECV_TIMEOUT, rx.recv())
                .await
                .expect("timed out waiting for signaling message")
                .expect("signaling channel closed");
            if message.event == event {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn test_start_offer_sends_offer_and_enters_signaling() {
        let env = endpoints();
        let mut host_rx = env.host_channel.subscribe();

        env.participant.start_offer().await.expect("start_offer");
        assert_eq!(
            env.participant.phase(),
            ConnectionPhase::Signaling(NegotiationDirection::Offering)
        );

        let offer = next_message(&mut host_rx, SignalEvent::Offer).await;
        let description = offer.description().expect("offer payload");
        assert_eq!(description.sdp_type, "offer");
        assert!(!description.sdp.is_empty());
    }

    #[tokio::test]
    async fn test_offer_answer_handshake_reaches_ice_negotiating() {
        let env = endpoints();
        let mut host_rx = env.host_channel.subscribe();
        let mut participant_rx = env.participant_channel.subscribe();

        env.participant.start_offer().await.expect("start_offer");
        let offer = next_message(&mut host_rx, SignalEvent::Offer).await;

        env.host.handle_signal(offer).await.expect("handle offer");
        assert_eq!(env.host.phase(), ConnectionPhase::IceNegotiating);

        let answer = next_message(&mut participant_rx, SignalEvent::Answer).await;
        env.participant
            .handle_signal(answer)
            .await
            .expect("handle answer");
        assert_eq!(env.participant.phase(), ConnectionPhase::IceNegotiating);
    }

    #[tokio::test]
    async fn test_answer_outside_offering_phase_is_dropped() {
        let env = endpoints();

        let bogus = DescriptionPayload::answer("v=0".to_string());
        env.participant
            .handle_answer(bogus)
            .await
            .expect("dropped answer is not an error");
        assert_eq!(env.participant.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_offer_while_negotiating_is_dropped() {
        let env = endpoints();
        let mut host_rx = env.host_channel.subscribe();

        env.participant.start_offer().await.expect("start_offer");
        let offer = next_message(&mut host_rx, SignalEvent::Offer).await;
        let payload = offer.description().expect("offer payload");

        // Participant is mid-negotiation; a crossing offer must not reset it.
        env.participant
            .handle_offer(payload)
            .await
            .expect("dropped offer is not an error");
        assert_eq!(
            env.participant.phase(),
            ConnectionPhase::Signaling(NegotiationDirection::Offering)
        );
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered_then_flushed() {
        let env = endpoints();
        let mut host_rx = env.host_channel.subscribe();
        let mut participant_rx = env.participant_channel.subscribe();

        // Candidate arrives before any description: machine stays idle and
        // queues it.
        let early = CandidatePayload {
            candidate: "candidate:1 1 UDP 2130706431 192.0.2.10 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        env.host
            .handle_candidate(early)
            .await
            .expect("buffer candidate");
        assert_eq!(env.host.phase(), ConnectionPhase::Idle);
        assert_eq!(env.host.buffered_candidates().await, (0, 1));

        env.participant.start_offer().await.expect("start_offer");
        let offer = next_message(&mut host_rx, SignalEvent::Offer).await;
        env.host.handle_signal(offer).await.expect("handle offer");

        // Answering flushed the buffer.
        assert_eq!(env.host.buffered_candidates().await, (0, 0));
        let answer = next_message(&mut participant_rx, SignalEvent::Answer).await;
        assert_eq!(answer.event, SignalEvent::Answer);
    }

    #[tokio::test]
    async fn test_flush_applies_inbound_and_sends_outbound_candidates() {
        let env = endpoints();
        let mut host_rx = env.host_channel.subscribe();
        let mut participant_rx = env.participant_channel.subscribe();

        // Both directions queue while the host leg is still idle.
        let inbound = CandidatePayload {
            candidate: "candidate:1 1 UDP 2130706431 192.0.2.10 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let outbound = CandidatePayload {
            candidate: "candidate:2 1 UDP 2130706175 192.0.2.11 54322 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        env.host
            .handle_candidate(inbound)
            .await
            .expect("buffer inbound");
        env.host.handle_local_candidate(outbound.clone()).await;
        assert_eq!(env.host.buffered_candidates().await, (1, 1));

        env.participant.start_offer().await.expect("start_offer");
        let offer = next_message(&mut host_rx, SignalEvent::Offer).await;
        env.host.handle_signal(offer).await.expect("handle offer");

        // Answering drained both queues: the local candidate went out over
        // signaling, the remote one was handed to the transport.
        assert_eq!(env.host.buffered_candidates().await, (0, 0));
        let relayed = next_message(&mut participant_rx, SignalEvent::IceCandidate).await;
        assert_eq!(relayed.candidate().expect("candidate payload"), outbound);
    }

    #[tokio::test]
    async fn test_late_candidate_without_transport_is_dropped() {
        let env = endpoints();
        let mut host_rx = env.host_channel.subscribe();

        env.participant.start_offer().await.expect("start_offer");
        let offer = next_message(&mut host_rx, SignalEvent::Offer).await;
        env.host.handle_signal(offer).await.expect("handle offer");
        assert_eq!(env.host.phase(), ConnectionPhase::IceNegotiating);

        // Straggler arriving after the transport is gone but before the
        // machine closes: logged and dropped, never an error.
        env.host.force_teardown().await;
        let late = CandidatePayload {
            candidate: "candidate:3 1 UDP 2130705919 192.0.2.12 54323 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        env.host
            .handle_candidate(late)
            .await
            .expect("late candidate is dropped, not an error");
        assert_eq!(env.host.phase(), ConnectionPhase::IceNegotiating);
    }

    #[tokio::test]
    async fn test_malformed_offer_leaves_machine_idle() {
        let env = endpoints();

        let garbage = DescriptionPayload::offer("not an sdp".to_string());
        env.host
            .handle_offer(garbage)
            .await
            .expect("malformed offer is dropped, not an error");
        assert_eq!(env.host.phase(), ConnectionPhase::Idle);

        // A valid offer afterwards still goes through.
        let mut host_rx = env.host_channel.subscribe();
        env.participant.start_offer().await.expect("start_offer");
        let offer = next_message(&mut host_rx, SignalEvent::Offer).await;
        env.host.handle_signal(offer).await.expect("handle offer");
        assert_eq!(env.host.phase(), ConnectionPhase::IceNegotiating);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_emits_one_event() {
        let mut env = endpoints();

        env.participant.start_offer().await.expect("start_offer");
        env.participant.close().await.expect("first close");
        env.participant.close().await.expect("second close");
        assert_eq!(env.participant.phase(), ConnectionPhase::Closed);

        let mut closed_events = 0;
        while let Ok(event) = env.events_rx.try_recv() {
            if event.to == ConnectionPhase::Closed {
                closed_events += 1;
            }
        }
        assert_eq!(closed_events, 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_failure_bumps_generation_and_reoffers() {
        let env = endpoints();
        let mut host_rx = env.host_channel.subscribe();

        env.participant.start_offer().await.expect("start_offer");
        next_message(&mut host_rx, SignalEvent::Offer).await;
        let generation = env.participant.generation();

        env.participant.mark_failed("test-induced failure").await;
        assert_eq!(env.participant.phase(), ConnectionPhase::Failed);

        let started = env
            .participant
            .begin_reconnect()
            .await
            .expect("begin_reconnect");
        assert!(started);
        assert_eq!(
            env.participant.phase(),
            ConnectionPhase::Signaling(NegotiationDirection::Offering)
        );
        assert_eq!(env.participant.generation(), generation + 1);

        let reoffer = next_message(&mut host_rx, SignalEvent::Offer).await;
        assert!(!reoffer.description().expect("payload").sdp.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_in_live_phase_is_ignored() {
        let env = endpoints();

        env.participant.start_offer().await.expect("start_offer");
        let generation = env.participant.generation();
        let started = env
            .participant
            .begin_reconnect()
            .await
            .expect("ignored reconnect is not an error");
        assert!(!started);
        assert_eq!(env.participant.generation(), generation);
        assert_eq!(
            env.participant.phase(),
            ConnectionPhase::Signaling(NegotiationDirection::Offering)
        );
    }

    #[tokio::test]
    async fn test_bound_tracks_survive_into_health_snapshot() {
        let env = endpoints();

        let tracks = StaticMediaSource::new().acquire().await.expect("tracks");
        env.participant
            .bind_local_tracks(tracks)
            .await
            .expect("bind before transport stores tracks");

        env.participant.start_offer().await.expect("start_offer");
        let sample = env.participant.health_snapshot().await;
        assert!(sample.track_present);
        assert!(!sample.transport_active);
    }

    #[tokio::test]
    async fn test_messages_after_close_are_dropped() {
        let env = endpoints();

        env.host.close().await.expect("close");
        let candidate = CandidatePayload {
            candidate: "candidate:1 1 UDP 2130706431 192.0.2.10 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        env.host
            .handle_candidate(candidate)
            .await
            .expect("candidate after close is dropped");
        env.host
            .handle_offer(DescriptionPayload::offer("v=0".to_string()))
            .await
            .expect("offer after close is dropped");
        assert_eq!(env.host.phase(), ConnectionPhase::Closed);
        assert_eq!(env.host.buffered_candidates().await, (0, 0));
    }

    #[tokio::test]
    async fn test_record_media_activity_refreshes_age() {
        let env = endpoints();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stale = env.participant.health_snapshot().await;
        env.participant.record_media_activity().await;
        let fresh = env.participant.health_snapshot().await;
        assert!(fresh.last_activity_age_ms < stale.last_activity_age_ms);
    }
}
