//! Fixed-order transceiver slot allocation

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};
use crate::participant::Role;

/// Media kinds carried by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Camera video
    Video,
    /// Microphone audio
    Audio,
}

/// Fixed slot allocation order for every connection
pub const SLOT_ORDER: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

impl MediaKind {
    /// Codec type used by the underlying transceiver
    pub fn codec_type(&self) -> RTPCodecType {
        match self {
            MediaKind::Video => RTPCodecType::Video,
            MediaKind::Audio => RTPCodecType::Audio,
        }
    }

    /// Kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
struct Slot {
    kind: MediaKind,
    transceiver: Arc<RTCRtpTransceiver>,
}

/// Order-stable transceiver slots for one peer connection.
///
/// Repeatedly adding and removing media lines on a live connection is the
/// dominant source of renegotiation storms and media-line-index mismatches
/// between the two ends. Every slot the connection will ever need is created
/// here once, one per media kind in the fixed [`SLOT_ORDER`], before any
/// negotiation. All later media changes go through [`bind_track`], an
/// in-place substitution on the existing slot's sender.
///
/// [`bind_track`]: SlotSet::bind_track
pub struct SlotSet {
    slots: Vec<Slot>,
}

impl SlotSet {
    /// Allocate one transceiver per media kind, in fixed order, with
    /// directions appropriate to the local role: a participant's video slot
    /// sends, a host's receives; audio slots start inactive, reserving their
    /// line index without forcing early renegotiation.
    pub async fn allocate(pc: &RTCPeerConnection, role: Role) -> Result<Self> {
        let mut slots = Vec::with_capacity(SLOT_ORDER.len());
        for kind in SLOT_ORDER {
            let direction = initial_direction(role, kind);
            let transceiver = pc
                .add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    Error::PeerConnectionError(format!("Failed to allocate {} slot: {}", kind, e))
                })?;
            debug!(kind = %kind, direction = ?direction, "allocated transceiver slot");
            slots.push(Slot { kind, transceiver });
        }
        Ok(Self { slots })
    }

    /// Substitute the track carried by a slot, in place.
    ///
    /// Never creates or removes a slot. An inactive slot is promoted to
    /// sendonly on first bind.
    pub async fn bind_track(
        &self,
        kind: MediaKind,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<()> {
        let slot = self
            .slot(kind)
            .ok_or_else(|| Error::MediaTrackError(format!("No {} slot allocated", kind)))?;
        let sender = slot.transceiver.sender().await;
        sender
            .replace_track(Some(track))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to bind {} track: {}", kind, e)))?;
        if slot.transceiver.direction() == RTCRtpTransceiverDirection::Inactive {
            slot.transceiver
                .set_direction(RTCRtpTransceiverDirection::Sendonly)
                .await;
        }
        debug!(kind = %kind, "bound track to slot");
        Ok(())
    }

    /// Sender backing a slot
    pub async fn sender(&self, kind: MediaKind) -> Option<Arc<RTCRtpSender>> {
        match self.slot(kind) {
            Some(slot) => Some(slot.transceiver.sender().await),
            None => None,
        }
    }

    /// True when some slot's sender currently carries a track
    pub async fn any_track_bound(&self) -> bool {
        for slot in &self.slots {
            if slot.transceiver.sender().await.track().await.is_some() {
                return true;
            }
        }
        false
    }

    /// Confirm the connection still exposes the allocated slots in the
    /// recorded kind order.
    ///
    /// A `false` result is a fatal integrity violation for this connection,
    /// surfaced by the caller as an error, never corrected in place.
    pub async fn validate_order(&self, pc: &RTCPeerConnection) -> bool {
        let observed = pc.get_transceivers().await;
        if observed.len() < self.slots.len() {
            warn!(
                observed = observed.len(),
                allocated = self.slots.len(),
                "transceiver count shrank"
            );
            return false;
        }
        for (slot, transceiver) in self.slots.iter().zip(observed.iter()) {
            if transceiver.kind() != slot.kind.codec_type() {
                warn!(expected = %slot.kind, "transceiver kind order changed");
                return false;
            }
        }
        true
    }

    /// Recorded allocation order
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.slots.iter().map(|s| s.kind).collect()
    }

    /// Number of allocated slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slots are held (before allocation or after release)
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop slot handles. Idempotent; closing the peer connection stops the
    /// transceivers themselves.
    pub fn release(&mut self) {
        self.slots.clear();
    }

    fn slot(&self, kind: MediaKind) -> Option<&Slot> {
        self.slots.iter().find(|s| s.kind == kind)
    }
}

fn initial_direction(role: Role, kind: MediaKind) -> RTCRtpTransceiverDirection {
    match (role, kind) {
        (Role::Participant, MediaKind::Video) => RTCRtpTransceiverDirection::Sendonly,
        (Role::Host, MediaKind::Video) => RTCRtpTransceiverDirection::Recvonly,
        (_, MediaKind::Audio) => RTCRtpTransceiverDirection::Inactive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    async fn test_pc() -> RTCPeerConnection {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let registry = register_default_interceptors(Default::default(), &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap()
    }

    fn video_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "stagelink".to_owned(),
        ))
    }

    fn audio_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "stagelink".to_owned(),
        ))
    }

    #[tokio::test]
    async fn test_allocate_creates_slots_in_fixed_order() {
        let pc = test_pc().await;
        let slots = SlotSet::allocate(&pc, Role::Participant).await.unwrap();

        assert_eq!(slots.len(), 2);
        assert_eq!(slots.kinds(), vec![MediaKind::Video, MediaKind::Audio]);
        assert!(slots.validate_order(&pc).await);
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_directions_follow_role() {
        let pc = test_pc().await;
        let _slots = SlotSet::allocate(&pc, Role::Participant).await.unwrap();
        let transceivers = pc.get_transceivers().await;
        assert_eq!(
            transceivers[0].direction(),
            RTCRtpTransceiverDirection::Sendonly
        );
        assert_eq!(
            transceivers[1].direction(),
            RTCRtpTransceiverDirection::Inactive
        );
        pc.close().await.unwrap();

        let pc = test_pc().await;
        let _slots = SlotSet::allocate(&pc, Role::Host).await.unwrap();
        let transceivers = pc.get_transceivers().await;
        assert_eq!(
            transceivers[0].direction(),
            RTCRtpTransceiverDirection::Recvonly
        );
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_track_substitutes_in_place() {
        let pc = test_pc().await;
        let slots = SlotSet::allocate(&pc, Role::Participant).await.unwrap();
        assert!(!slots.any_track_bound().await);

        slots
            .bind_track(MediaKind::Video, video_track())
            .await
            .unwrap();

        assert!(slots.any_track_bound().await);
        assert_eq!(slots.len(), 2);
        assert_eq!(pc.get_transceivers().await.len(), 2);
        assert!(slots.validate_order(&pc).await);
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_bind_promotes_inactive_slot() {
        let pc = test_pc().await;
        let slots = SlotSet::allocate(&pc, Role::Participant).await.unwrap();

        slots
            .bind_track(MediaKind::Audio, audio_track())
            .await
            .unwrap();

        let transceivers = pc.get_transceivers().await;
        assert_eq!(
            transceivers[1].direction(),
            RTCRtpTransceiverDirection::Sendonly
        );
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_binds_fail_after() {
        let pc = test_pc().await;
        let mut slots = SlotSet::allocate(&pc, Role::Participant).await.unwrap();

        slots.release();
        slots.release();
        assert!(slots.is_empty());

        let err = slots
            .bind_track(MediaKind::Video, video_track())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaTrackError(_)));
        pc.close().await.unwrap();
    }
}
