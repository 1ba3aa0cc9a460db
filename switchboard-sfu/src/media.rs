//! Media engine seam
//!
//! The engine never touches the WebRTC library directly. Everything it needs
//! from a peer connection goes through [`MediaConnection`], and every library
//! callback arrives as a [`ConnectionEvent`] on the channel returned by
//! [`ConnectionFactory::create`]. Callbacks therefore never mutate room or
//! peer state from the library's internal threads.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::error::Result;
use crate::signal::{IceCandidate, SessionDescription};
use crate::track::TrackKind;
use crate::types::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by a media connection, in the order the library raised them
pub enum ConnectionEvent {
    /// Locally gathered candidate; `None` once gathering is complete
    Candidate(Option<IceCandidate>),
    /// The remote side started publishing a track
    Track(Arc<dyn InboundTrack>),
    IceState(IceState),
    ConnectionState(ConnectionState),
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// RTCP feedback that asks the publisher's encoder for a new keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    PictureLoss,
    FullIntraRequest,
}

/// A track received from a publisher
#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn id(&self) -> TrackId;
    fn kind(&self) -> TrackKind;
    fn ssrc(&self) -> u32;
    fn codec(&self) -> RTCRtpCodecCapability;

    /// Next RTP packet; an error ends the track
    async fn read_packet(&self) -> Result<Packet>;
}

/// Local track on a subscriber's connection that relayed packets are written into
#[async_trait]
pub trait RelayTrack: Send + Sync {
    async fn write_packet(&self, packet: &Packet) -> Result<()>;
}

/// Outbound sender carrying a [`RelayTrack`]
#[async_trait]
pub trait RelaySender: Send + Sync {
    /// Keyframe requests received from the subscriber; an error means the
    /// sender is gone
    async fn read_feedback(&self) -> Result<Vec<Feedback>>;

    /// Remove the sender from its connection
    async fn detach(&self) -> Result<()>;
}

/// Parameters of a relayed track
#[derive(Debug, Clone)]
pub struct RelaySpec {
    pub codec: RTCRtpCodecCapability,
    pub track_id: String,
    /// Stream id seen by the subscriber; the publisher's peer id, so the
    /// browser groups a publisher's tracks together
    pub stream_id: String,
}

pub struct RelayAttachment {
    pub sender: Arc<dyn RelaySender>,
    pub track: Arc<dyn RelayTrack>,
}

/// One participant's peer connection
#[async_trait]
pub trait MediaConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    /// The local description actually committed, if any
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// Discard a pending local offer, returning to `stable`
    async fn rollback(&self) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_relay_track(&self, spec: RelaySpec) -> Result<RelayAttachment>;
    /// Send a picture loss indication for one of this connection's inbound tracks
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds peer connections with their event channel already wired
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn MediaConnection>, ConnectionEvents)>;
}
