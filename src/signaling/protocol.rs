//! Transport-agnostic signaling message types

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::{Error, Result};
use crate::participant::{ParticipantId, Role};

/// Signaling event kinds carried by a [`SignalMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalEvent {
    /// SDP offer for a participant leg
    Offer,

    /// SDP answer for a participant leg
    Answer,

    /// Trickled ICE candidate
    IceCandidate,

    /// Participant announces itself to the session
    Join,

    /// Participant leaves the session
    Leave,
}

impl SignalEvent {
    /// Wire name of this event
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalEvent::Offer => "offer",
            SignalEvent::Answer => "answer",
            SignalEvent::IceCandidate => "ice-candidate",
            SignalEvent::Join => "join",
            SignalEvent::Leave => "leave",
        }
    }
}

impl std::fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical signaling message exchanged through the channel.
///
/// `participant_id` always identifies the participant leg of the connection
/// the message concerns: the host routes inbound messages by it and addresses
/// outbound messages with it; a participant endpoint filters for its own id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMessage {
    /// Message type
    #[serde(rename = "type")]
    pub event: SignalEvent,

    /// Participant leg this message concerns
    #[serde(rename = "participantId")]
    pub participant_id: ParticipantId,

    /// Event payload (shape depends on `event`)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,

    /// Sender clock at emission, epoch milliseconds
    pub timestamp: u64,
}

/// Session description payload for offer/answer messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DescriptionPayload {
    /// Description kind ("offer" or "answer")
    #[serde(rename = "type")]
    pub sdp_type: String,

    /// Raw SDP text
    pub sdp: String,
}

/// ICE candidate payload, mirroring `RTCIceCandidateInit`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidatePayload {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Payload announcing a joining participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinPayload {
    /// Role of the joining endpoint
    pub role: Role,
}

impl DescriptionPayload {
    /// Offer payload from raw SDP
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp,
        }
    }

    /// Answer payload from raw SDP
    pub fn answer(sdp: String) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp,
        }
    }
}

impl CandidatePayload {
    /// Build from a gathered local candidate
    pub fn from_init(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }

    /// Convert into the form the peer connection applies
    pub fn into_init(self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
            ..Default::default()
        }
    }
}

impl SignalMessage {
    fn new(event: SignalEvent, participant_id: ParticipantId, payload: serde_json::Value) -> Self {
        Self {
            event,
            participant_id,
            payload,
            timestamp: current_timestamp_ms(),
        }
    }

    /// Build an offer message
    pub fn offer(participant_id: ParticipantId, sdp: String) -> Self {
        let payload = serde_json::to_value(DescriptionPayload::offer(sdp))
            .unwrap_or(serde_json::Value::Null);
        Self::new(SignalEvent::Offer, participant_id, payload)
    }

    /// Build an answer message
    pub fn answer(participant_id: ParticipantId, sdp: String) -> Self {
        let payload = serde_json::to_value(DescriptionPayload::answer(sdp))
            .unwrap_or(serde_json::Value::Null);
        Self::new(SignalEvent::Answer, participant_id, payload)
    }

    /// Build an ice-candidate message
    pub fn ice_candidate(participant_id: ParticipantId, candidate: CandidatePayload) -> Self {
        let payload = serde_json::to_value(candidate).unwrap_or(serde_json::Value::Null);
        Self::new(SignalEvent::IceCandidate, participant_id, payload)
    }

    /// Build a join announcement
    pub fn join(participant_id: ParticipantId, role: Role) -> Self {
        let payload = serde_json::to_value(JoinPayload { role }).unwrap_or(serde_json::Value::Null);
        Self::new(SignalEvent::Join, participant_id, payload)
    }

    /// Build a leave notification
    pub fn leave(participant_id: ParticipantId) -> Self {
        Self::new(SignalEvent::Leave, participant_id, serde_json::Value::Null)
    }

    /// Extract the description payload of an offer/answer message
    pub fn description(&self) -> Result<DescriptionPayload> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::NegotiationError(format!(
                "Malformed {} payload from {}: {}",
                self.event, self.participant_id, e
            ))
        })
    }

    /// Extract the candidate payload of an ice-candidate message
    pub fn candidate(&self) -> Result<CandidatePayload> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::IceCandidateError(format!(
                "Malformed ice-candidate payload from {}: {}",
                self.participant_id, e
            ))
        })
    }

    /// Extract the join payload of a join message
    pub fn join_payload(&self) -> Result<JoinPayload> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::SerializationError(format!(
                "Malformed join payload from {}: {}",
                self.participant_id, e
            ))
        })
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signal message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize signal message: {}", e))
        })
    }
}

/// Get current timestamp in milliseconds since the Unix epoch
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
