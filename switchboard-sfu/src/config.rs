//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A STUN or TURN server handed to every peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Codecs registered with the media engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub audio_opus: bool,
    pub video_vp8: bool,
    pub video_vp9: bool,
    pub video_h264: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            audio_opus: true,
            video_vp8: true,
            video_vp9: true,
            video_h264: true,
        }
    }
}

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// ICE servers used when constructing peer connections
    pub ice_servers: Vec<IceServerConfig>,
    /// Window in which renegotiation requests coalesce into one offer
    pub negotiation_debounce_ms: u64,
    /// Poll interval while waiting for the signaling state to become stable
    pub stability_poll_ms: u64,
    /// ICE candidates buffered before a remote description is set
    pub candidate_queue_max: usize,
    /// Outbound signaling messages buffered per peer
    pub send_queue_capacity: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Forward PLI/FIR from subscribers back to the publisher
    pub relay_keyframe_requests: bool,
    pub codecs: CodecConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            negotiation_debounce_ms: 50,
            stability_poll_ms: 20,
            candidate_queue_max: 256,
            send_queue_capacity: 256,
            max_peers_per_room: 0,
            relay_keyframe_requests: true,
            codecs: CodecConfig::default(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn negotiation_debounce(&self) -> Duration {
        Duration::from_millis(self.negotiation_debounce_ms)
    }

    #[must_use]
    pub const fn stability_poll(&self) -> Duration {
        Duration::from_millis(self.stability_poll_ms)
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.send_queue_capacity == 0 {
            errors.push("sfu.send_queue_capacity must be greater than 0".to_string());
        }
        if self.candidate_queue_max == 0 {
            errors.push("sfu.candidate_queue_max must be greater than 0".to_string());
        }
        if self.stability_poll_ms == 0 {
            errors.push("sfu.stability_poll_ms must be greater than 0".to_string());
        }
        for (i, server) in self.ice_servers.iter().enumerate() {
            if server.urls.is_empty() {
                errors.push(format!("sfu.ice_servers[{i}] has no urls"));
            }
            for url in &server.urls {
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                if !is_turn && !url.starts_with("stun:") && !url.starts_with("stuns:") {
                    errors.push(format!("sfu.ice_servers[{i}] has unsupported url '{url}'"));
                }
                if is_turn && (server.username.is_empty() || server.credential.is_empty()) {
                    errors.push(format!(
                        "sfu.ice_servers[{i}] TURN url '{url}' requires username and credential"
                    ));
                }
            }
        }
        let codecs = self.codecs;
        if !(codecs.audio_opus || codecs.video_vp8 || codecs.video_vp9 || codecs.video_h264) {
            errors.push("sfu.codecs must enable at least one codec".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
