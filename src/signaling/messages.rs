use serde::{Deserialize, Serialize};

use super::types::{OutboundMessage, Role, RoomId};

/// Every message that travels over the signaling channel, in both directions.
///
/// `join` is interpreted by the server, `ready` and `error` are produced by
/// it, and the remaining kinds are relayed verbatim between the two room
/// members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Join (or create) a room
    Join { room: RoomId },

    /// The room now holds two members; carries the receiver's role
    Ready { role: Role },

    /// Caller's proposed session description
    Offer { offer: SessionDescription },

    /// Callee's session description
    Answer { answer: SessionDescription },

    /// Connectivity candidate; `null` marks end-of-candidates
    Candidate {
        #[serde(default)]
        candidate: Option<IceCandidate>,
    },

    /// Translated transcript, opaque to the relay
    Translation(Translation),

    /// Join rejected
    Error { message: String },

    /// Any `type` tag this side does not know about
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Ready { .. } => "ready",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Translation(_) => "translation",
            SignalMessage::Error { .. } => "error",
            SignalMessage::Unknown => "unknown",
        }
    }

    /// Kinds a client may send that get forwarded to the other member
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            SignalMessage::Offer { .. }
                | SignalMessage::Answer { .. }
                | SignalMessage::Candidate { .. }
                | SignalMessage::Translation(_)
        )
    }

    pub fn to_outbound(&self) -> Result<OutboundMessage, serde_json::Error> {
        serde_json::to_string(self).map(OutboundMessage::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description as produced by the media library (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    /// An empty candidate line is the end-of-candidates marker
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// Transcript relayed between participants. The server forwards it as-is, so
/// every field is optional: senders may leave any of them null or out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    #[serde(default)]
    pub translated_text: Option<String>,
    #[serde(default)]
    pub source_language: Option<String>,
    #[serde(default)]
    pub target_language: Option<String>,
    #[serde(default)]
    pub detected_language: Option<String>,
}
