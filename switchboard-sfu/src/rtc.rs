//! `webrtc` crate implementation of the media engine seam

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::{CodecConfig, SfuConfig};
use crate::error::{Result, SfuError};
use crate::media::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState, Feedback, IceState,
    InboundTrack, MediaConnection, RelayAttachment, RelaySender, RelaySpec, RelayTrack,
    SignalingState,
};
use crate::signal::{IceCandidate, SdpType, SessionDescription};
use crate::track::TrackKind;
use crate::types::TrackId;

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

fn video_codec(mime_type: &str, payload_type: u8, fmtp: &str) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: fmtp.to_string(),
            rtcp_feedback: video_feedback(),
        },
        payload_type,
        ..Default::default()
    }
}

fn build_media_engine(codecs: CodecConfig) -> Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    if codecs.audio_opus {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
    }
    if codecs.video_vp8 {
        media_engine.register_codec(video_codec("video/VP8", 96, ""), RTPCodecType::Video)?;
    }
    if codecs.video_vp9 {
        media_engine
            .register_codec(video_codec("video/VP9", 98, "profile-id=0"), RTPCodecType::Video)?;
    }
    if codecs.video_h264 {
        media_engine.register_codec(
            video_codec(
                "video/H264",
                102,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            ),
            RTPCodecType::Video,
        )?;
    }

    Ok(media_engine)
}

/// Builds `webrtc` peer connections sharing one API instance
pub struct WebRtcFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcFactory {
    pub fn new(config: &SfuConfig) -> Result<Self> {
        let mut media_engine = build_media_engine(config.codecs)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        info!(ice_servers = ice_servers.len(), "WebRTC API initialized");

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn create(&self) -> Result<(Arc<dyn MediaConnection>, ConnectionEvents)> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        wire_events(&pc, &tx);
        let connection: Arc<dyn MediaConnection> = Arc::new(WebRtcConnection { pc });
        Ok((connection, rx))
    }
}

/// Turn every callback into a channel message. Sends only fail once the
/// owning peer has stopped listening, which is fine to ignore.
fn wire_events(pc: &RTCPeerConnection, tx: &mpsc::UnboundedSender<ConnectionEvent>) {
    let events = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let converted = match candidate.map(|c| c.to_json()).transpose() {
            Ok(init) => Some(init.map(candidate_from_rtc)),
            Err(e) => {
                warn!(error = %e, "Failed to serialize ICE candidate");
                None
            }
        };
        if let Some(candidate) = converted {
            let _ = events.send(ConnectionEvent::Candidate(candidate));
        }
        Box::pin(async {})
    }));

    let events = tx.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let _ = events.send(ConnectionEvent::Track(Arc::new(RemoteTrack::new(track))));
        Box::pin(async {})
    }));

    let events = tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = events.send(ConnectionEvent::IceState(ice_state_from_rtc(state)));
        Box::pin(async {})
    }));

    let events = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = events.send(ConnectionEvent::ConnectionState(connection_state_from_rtc(
            state,
        )));
        Box::pin(async {})
    }));
}

const fn ice_state_from_rtc(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}

const fn connection_state_from_rtc(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

const fn signaling_state_from_rtc(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        // Unspecified never appears on a live connection
        RTCSignalingState::Unspecified | RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn candidate_from_rtc(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn description_to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        other => {
            return Err(SfuError::Signaling(format!(
                "unsupported description type {other:?}"
            )))
        }
    };
    Ok(parsed)
}

fn description_from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    }
}

/// A participant's `RTCPeerConnection`
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    fn signaling_state(&self) -> SignalingState {
        signaling_state_from_rtc(self.pc.signaling_state())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        Ok(description_from_rtc(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(description_from_rtc(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(description_to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(description_from_rtc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(description_to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        // The library parses the SDP body even for a rollback, so reuse the
        // pending offer's body
        let Some(mut pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        pending.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(pending).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_relay_track(&self, spec: RelaySpec) -> Result<RelayAttachment> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            spec.codec,
            spec.track_id,
            spec.stream_id,
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        Ok(RelayAttachment {
            sender: Arc::new(WebRtcSender {
                pc: Arc::clone(&self.pc),
                sender,
            }),
            track: Arc::new(LocalRelayTrack { track }),
        })
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Inbound `TrackRemote`
pub struct RemoteTrack {
    track: Arc<TrackRemote>,
    id: TrackId,
}

impl RemoteTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        // Some clients publish without an msid; fall back to the SSRC
        let id = match track.id() {
            id if id.is_empty() => TrackId::new(track.ssrc().to_string()),
            id => TrackId::new(id),
        };
        debug!(
            track_id = %id,
            kind = ?track.kind(),
            codec = %track.codec().capability.mime_type,
            "Remote track received"
        );
        Self { track, id }
    }
}

#[async_trait]
impl InboundTrack for RemoteTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::from(self.track.kind())
    }

    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.track.codec().capability
    }

    async fn read_packet(&self) -> Result<Packet> {
        let (packet, _attributes) = self.track.read_rtp().await?;
        Ok(packet)
    }
}

struct LocalRelayTrack {
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl RelayTrack for LocalRelayTrack {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.track.write_rtp(packet).await?;
        Ok(())
    }
}

struct WebRtcSender {
    pc: Arc<RTCPeerConnection>,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl RelaySender for WebRtcSender {
    async fn read_feedback(&self) -> Result<Vec<Feedback>> {
        let (packets, _attributes) = self.sender.read_rtcp().await?;
        Ok(packets
            .iter()
            .filter_map(|packet| {
                let any = packet.as_any();
                if any.downcast_ref::<PictureLossIndication>().is_some() {
                    Some(Feedback::PictureLoss)
                } else if any.downcast_ref::<FullIntraRequest>().is_some() {
                    Some(Feedback::FullIntraRequest)
                } else {
                    None
                }
            })
            .collect())
    }

    async fn detach(&self) -> Result<()> {
        self.pc.remove_track(&self.sender).await?;
        Ok(())
    }
}
