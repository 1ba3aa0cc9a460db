use thiserror::Error;

use crate::types::{PeerId, RoomId};

/// Errors produced by the SFU engine
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Invalid signaling message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Peer {peer_id} already joined room {room_id}")]
    DuplicatePeer { room_id: RoomId, peer_id: PeerId },

    #[error("Room {room_id} is full ({max_peers} peers)")]
    RoomFull { room_id: RoomId, max_peers: usize },

    #[error("Peer {0} is closed")]
    PeerClosed(PeerId),

    #[error("Send queue full for peer {0}")]
    QueueFull(PeerId),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<webrtc::Error> for SfuError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}

pub type Result<T, E = SfuError> = std::result::Result<T, E>;
