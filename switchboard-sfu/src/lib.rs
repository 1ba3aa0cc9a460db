//! Switchboard SFU (Selective Forwarding Unit)
//!
//! A WebRTC SFU for multi-party rooms. Every participant publishes its
//! media once; the SFU relays each RTP packet unchanged to every other
//! participant in the same room and keeps each peer connection renegotiated
//! as tracks come and go.
//!
//! ## Architecture
//!
//! - **`RoomRegistry`**: owns every room, created on first join
//! - **`Room`**: peers and their published tracks
//! - **`Peer`**: one media connection plus its signaling queue and relays
//! - **negotiation worker**: coalesced, glare-safe server offers per peer
//! - **fanout pipeline**: one forwarding task per published track
//! - **session**: per-peer tasks and ordered teardown
//!
//! The WebRTC library sits behind the traits in [`media`]; [`WebRtcFactory`]
//! is the production implementation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use switchboard_sfu::{session, JoinRequest, RoomRegistry, SfuConfig, WebRtcFactory};
//!
//! let config = SfuConfig::default();
//! let factory = Arc::new(WebRtcFactory::new(&config)?);
//! let registry = RoomRegistry::new(config, factory);
//!
//! // per accepted signaling connection
//! session::run(registry.clone(), request, stream, sink).await?;
//! ```

mod config;
mod error;
mod manager;
pub mod media;
mod negotiation;
mod peer;
mod room;
mod rtc;
pub mod session;
mod signal;
mod track;
mod types;

#[cfg(test)]
mod testing;

pub use config::{CodecConfig, IceServerConfig, SfuConfig};
pub use error::{Result, SfuError};
pub use manager::RoomRegistry;
pub use peer::{Flow, Peer};
pub use room::{Room, RoomStats};
pub use rtc::WebRtcFactory;
pub use session::{JoinRequest, SignalingSink, SignalingStream};
pub use signal::{IceCandidate, SdpType, SessionDescription, SignalKind, SignalMessage};
pub use track::{PublishedTrack, TrackKind, TrackStats};
pub use types::{PeerId, RoomId, SenderKey, TrackId};
