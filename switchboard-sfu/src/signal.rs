//! Signaling wire protocol
//!
//! One JSON object per WebSocket text frame:
//!
//! ```json
//! {"type": "offer", "from": "alice", "offer": {"type": "offer", "sdp": "v=0..."}}
//! {"type": "candidate", "candidate": {"candidate": "candidate:1 ...", "sdpMid": "0", "sdpMLineIndex": 0}}
//! {"type": "candidate", "candidate": null}
//! {"type": "peer-left", "from": "alice"}
//! ```
//!
//! A `candidate` message with a `null` body marks the end of trickle ICE
//! and is distinct from a message with no `candidate` field at all.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;
use crate::types::{PeerId, RoomId};

/// Message type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Leave,
    PeerLeft,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description (SDP)
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

/// Trickled ICE candidate, in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// A single signaling message in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// `None` = field absent, `Some(None)` = explicit `null` (end of candidates)
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub candidate: Option<Option<IceCandidate>>,
}

/// Maps a present field (even `null`) to `Some`, leaving `None` for absent
fn present<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl SignalMessage {
    const fn empty(kind: SignalKind) -> Self {
        Self {
            kind,
            name: None,
            from: None,
            room: None,
            offer: None,
            answer: None,
            candidate: None,
        }
    }

    #[must_use]
    pub fn offer(desc: SessionDescription) -> Self {
        Self {
            offer: Some(desc),
            ..Self::empty(SignalKind::Offer)
        }
    }

    #[must_use]
    pub fn answer(desc: SessionDescription) -> Self {
        Self {
            answer: Some(desc),
            ..Self::empty(SignalKind::Answer)
        }
    }

    /// `None` produces the end-of-candidates marker
    #[must_use]
    pub fn candidate(candidate: Option<IceCandidate>) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::empty(SignalKind::Candidate)
        }
    }

    #[must_use]
    pub fn leave() -> Self {
        Self::empty(SignalKind::Leave)
    }

    #[must_use]
    pub fn peer_left(from: PeerId) -> Self {
        Self {
            from: Some(from),
            ..Self::empty(SignalKind::PeerLeft)
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
