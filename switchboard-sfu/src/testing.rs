//! In-memory fakes for the media seam and the signaling transport

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::error::{Result, SfuError};
use crate::media::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, Feedback, InboundTrack,
    MediaConnection, RelayAttachment, RelaySender, RelaySpec, RelayTrack, SignalingState,
};
use crate::session::{SignalingSink, SignalingStream};
use crate::signal::{IceCandidate, SdpType, SessionDescription, SignalKind, SignalMessage};
use crate::track::TrackKind;
use crate::types::TrackId;

/// A relay attached to a [`FakeConnection`]
#[derive(Clone)]
pub struct FakeRelay {
    pub spec: RelaySpec,
    pub sender: Arc<FakeSender>,
    pub track: Arc<FakeRelayTrack>,
}

struct ConnState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote_set: bool,
    applied_candidates: Vec<String>,
    relays: Vec<FakeRelay>,
    keyframe_requests: Vec<u32>,
    offers: Vec<bool>,
    rollbacks: usize,
    closed: bool,
}

/// Signaling state machine with the same transition rules as a browser
pub struct FakeConnection {
    state: Mutex<ConnState>,
    counter: AtomicUsize,
    fail_relays: AtomicBool,
    offer_before_remote: AtomicBool,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnState {
                signaling: SignalingState::Stable,
                local: None,
                remote_set: false,
                applied_candidates: Vec::new(),
                relays: Vec::new(),
                keyframe_requests: Vec::new(),
                offers: Vec::new(),
                rollbacks: 0,
                closed: false,
            }),
            counter: AtomicUsize::new(0),
            fail_relays: AtomicBool::new(false),
            offer_before_remote: AtomicBool::new(false),
        })
    }

    fn next_sdp(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn set_fail_relays(&self, fail: bool) {
        self.fail_relays.store(fail, Ordering::Relaxed);
    }

    /// Commit a local offer right before the next remote description is
    /// applied, as a negotiation cycle finishing at that moment would
    pub fn commit_offer_before_next_remote(&self) {
        self.offer_before_remote.store(true, Ordering::Relaxed);
    }

    pub fn state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    /// Relays whose sender has not been detached
    pub fn active_relays(&self) -> Vec<FakeRelay> {
        self.state
            .lock()
            .relays
            .iter()
            .filter(|relay| !relay.sender.is_detached())
            .cloned()
            .collect()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn keyframe_requests(&self) -> Vec<u32> {
        self.state.lock().keyframe_requests.clone()
    }

    /// One entry per created offer: whether it was an ICE restart
    pub fn offers_created(&self) -> Vec<bool> {
        self.state.lock().offers.clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn invalid(op: &str, state: SignalingState) -> SfuError {
    SfuError::Signaling(format!("{op} not allowed in {state:?}"))
}

#[async_trait]
impl MediaConnection for FakeConnection {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let sdp = self.next_sdp("offer");
        let mut state = self.state.lock();
        if state.closed {
            return Err(invalid("create_offer", SignalingState::Closed));
        }
        state.offers.push(ice_restart);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let sdp = self.next_sdp("answer");
        let state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(invalid("create_answer", state.signaling));
        }
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        state.signaling = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, current) => return Err(invalid("set_local_description", current)),
        };
        state.local = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.offer_before_remote.swap(false, Ordering::Relaxed) {
            let offer = self.create_offer(false).await?;
            self.set_local_description(offer).await?;
        }
        let mut state = self.state.lock();
        state.signaling = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, current) => return Err(invalid("set_remote_description", current)),
        };
        state.remote_set = true;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(invalid("rollback", state.signaling));
        }
        state.signaling = SignalingState::Stable;
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if !state.remote_set {
            return Err(SfuError::Signaling("no remote description".to_string()));
        }
        state.applied_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn add_relay_track(&self, spec: RelaySpec) -> Result<RelayAttachment> {
        if self.fail_relays.load(Ordering::Relaxed) {
            return Err(SfuError::WebRtc("add_track failed".to_string()));
        }
        let relay = FakeRelay {
            spec,
            sender: FakeSender::new(),
            track: Arc::new(FakeRelayTrack::default()),
        };
        let mut state = self.state.lock();
        if state.closed {
            return Err(invalid("add_relay_track", SignalingState::Closed));
        }
        state.relays.push(relay.clone());
        Ok(RelayAttachment {
            sender: relay.sender,
            track: relay.track,
        })
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        self.state.lock().keyframe_requests.push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Relay sender whose feedback is pushed by the test
pub struct FakeSender {
    detached: CancellationToken,
    feedback_tx: mpsc::UnboundedSender<Vec<Feedback>>,
    feedback_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Feedback>>>,
}

impl FakeSender {
    fn new() -> Arc<Self> {
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            detached: CancellationToken::new(),
            feedback_tx,
            feedback_rx: tokio::sync::Mutex::new(feedback_rx),
        })
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    pub fn push_feedback(&self, feedback: Vec<Feedback>) {
        let _ = self.feedback_tx.send(feedback);
    }
}

#[async_trait]
impl RelaySender for FakeSender {
    async fn read_feedback(&self) -> Result<Vec<Feedback>> {
        let mut rx = self.feedback_rx.lock().await;
        tokio::select! {
            () = self.detached.cancelled() => Err(SfuError::Transport("sender detached".to_string())),
            feedback = rx.recv() => feedback.ok_or_else(|| SfuError::Transport("feedback closed".to_string())),
        }
    }

    async fn detach(&self) -> Result<()> {
        self.detached.cancel();
        Ok(())
    }
}

/// Records the sequence numbers written to it
#[derive(Default)]
pub struct FakeRelayTrack {
    written: Mutex<Vec<u16>>,
}

impl FakeRelayTrack {
    pub fn written(&self) -> Vec<u16> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl RelayTrack for FakeRelayTrack {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.written.lock().push(packet.header.sequence_number);
        Ok(())
    }
}

/// Inbound track fed by the test
pub struct FakeTrack {
    id: TrackId,
    kind: TrackKind,
    ssrc: u32,
    tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Self::with_ssrc(id, kind, 1000)
    }

    pub fn with_ssrc(id: &str, kind: TrackKind, ssrc: u32) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: TrackId::from(id),
            kind,
            ssrc,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn push(&self, sequence_number: u16) {
        let packet = Packet {
            header: Header {
                sequence_number,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: Bytes::from_static(b"rtp-payload"),
        };
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(packet);
        }
    }

    /// End of stream; the forwarding loop sees a read error after the
    /// queued packets
    pub fn end(&self) {
        self.tx.lock().take();
    }
}

#[async_trait]
impl InboundTrack for FakeTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        let (mime_type, clock_rate, channels) = match self.kind {
            TrackKind::Audio => ("audio/opus", 48000, 2),
            TrackKind::Video => ("video/VP8", 90000, 0),
        };
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            ..Default::default()
        }
    }

    async fn read_packet(&self) -> Result<Packet> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SfuError::Transport("track ended".to_string()))
    }
}

/// Test-side handle to a connection created by [`FakeFactory`]
#[derive(Clone)]
pub struct FakeHandle {
    pub connection: Arc<FakeConnection>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl FakeHandle {
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn publish(&self, track: &Arc<FakeTrack>) {
        self.emit(ConnectionEvent::Track(Arc::clone(track) as Arc<dyn InboundTrack>));
    }
}

#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<FakeHandle>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn handle(&self, index: usize) -> Option<FakeHandle> {
        self.created.lock().get(index).cloned()
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self) -> Result<(Arc<dyn MediaConnection>, ConnectionEvents)> {
        let connection = FakeConnection::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.created.lock().push(FakeHandle {
            connection: Arc::clone(&connection),
            events: tx,
        });
        Ok((connection as Arc<dyn MediaConnection>, rx))
    }
}

/// Inbound half handed to the session
pub struct ChannelStream {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl SignalingStream for ChannelStream {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

/// Outbound half handed to the session
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl SignalingSink for ChannelSink {
    async fn send(&mut self, text: String) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SfuError::Transport("sink closed".to_string()))?;
        tx.send(text)
            .map_err(|_| SfuError::Transport("client gone".to_string()))
    }

    async fn close(&mut self) {
        self.tx.take();
    }
}

/// The browser's end of a channel transport
pub struct Client {
    tx: Option<mpsc::UnboundedSender<Result<String>>>,
    rx: mpsc::UnboundedReceiver<String>,
}

pub fn channel_transport() -> (Client, ChannelStream, ChannelSink) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        Client {
            tx: Some(in_tx),
            rx: out_rx,
        },
        ChannelStream { rx: in_rx },
        ChannelSink { tx: Some(out_tx) },
    )
}

impl Client {
    pub fn send(&self, message: &SignalMessage) {
        self.send_raw(&message.to_json().unwrap());
    }

    pub fn send_raw(&self, text: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    /// Deliver a transport error to the session's reader
    pub fn fail_read(&self, reason: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(SfuError::Transport(reason.to_string())));
        }
    }

    /// Close the client's side of the connection
    pub fn disconnect(&mut self) {
        self.tx.take();
    }

    /// Stop reading; later server writes fail
    pub fn stop_reading(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    /// Next message, or `None` if nothing arrives within `wait`
    pub async fn recv_within(&mut self, wait: Duration) -> Option<SignalMessage> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(text)) => Some(SignalMessage::parse(&text).unwrap()),
            _ => None,
        }
    }

    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.recv_within(Duration::from_secs(2)).await
    }

    /// Next message of `kind`, skipping everything else
    pub async fn expect(&mut self, kind: SignalKind) -> SignalMessage {
        loop {
            let message = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("no {kind:?} message received"));
            if message.kind == kind {
                return message;
            }
        }
    }

    /// Every message received until the connection stays quiet for `quiet`
    pub async fn collect(&mut self, quiet: Duration) -> Vec<SignalMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv_within(quiet).await {
            messages.push(message);
        }
        messages
    }

    /// True once the server closed its side
    pub async fn is_closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.rx.recv()).await,
            Ok(None)
        )
    }

    /// Answer the next server offer, as a browser would
    pub async fn answer_offer(&mut self) -> SignalMessage {
        let offer = self.expect(SignalKind::Offer).await;
        self.send(&SignalMessage::answer(SessionDescription::answer("client-answer")));
        offer
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
