//! Peer connection wrapper
//!
//! A [`Peer`] owns one media connection plus everything hanging off it:
//! the outbound signaling queue, the relay senders it carries for other
//! publishers, the remote-candidate buffer and the negotiation trigger.
//! Inbound signaling is routed through [`Peer::handle_signal`].

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::media::{MediaConnection, RelaySender, RelayTrack, SignalingState};
use crate::signal::{IceCandidate, SessionDescription, SignalKind, SignalMessage};
use crate::track::TrackKind;
use crate::types::{PeerId, RoomId, SenderKey};

/// What the session loop should do after a message has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Leave,
}

/// Relay senders and their local tracks, keyed by publisher and track
#[derive(Default)]
struct Relays {
    senders: HashMap<SenderKey, Arc<dyn RelaySender>>,
    local_video: HashMap<SenderKey, Arc<dyn RelayTrack>>,
    local_audio: HashMap<SenderKey, Arc<dyn RelayTrack>>,
}

impl Relays {
    fn locals_mut(&mut self, kind: TrackKind) -> &mut HashMap<SenderKey, Arc<dyn RelayTrack>> {
        match kind {
            TrackKind::Video => &mut self.local_video,
            TrackKind::Audio => &mut self.local_audio,
        }
    }

    fn local(&self, key: &SenderKey) -> Option<&Arc<dyn RelayTrack>> {
        self.local_video.get(key).or_else(|| self.local_audio.get(key))
    }
}

/// Remote candidates that arrived before a remote description
struct CandidateBuffer {
    remote_description_set: bool,
    pending: VecDeque<IceCandidate>,
    max: usize,
}

impl CandidateBuffer {
    fn new(max: usize) -> Self {
        Self {
            remote_description_set: false,
            pending: VecDeque::new(),
            max,
        }
    }

    /// Returns the candidate back if it can be applied right away
    fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            return Some(candidate);
        }
        if self.pending.len() >= self.max {
            self.pending.pop_front();
        }
        self.pending.push_back(candidate);
        None
    }

    fn mark_remote_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending.drain(..).collect()
    }
}

/// A participant in a room
pub struct Peer {
    pub id: PeerId,
    pub room_id: RoomId,
    pub name: Option<String>,
    connection: Arc<dyn MediaConnection>,
    /// Taken on close so the writer drains and exits
    outbound: Mutex<Option<mpsc::Sender<SignalMessage>>>,
    relays: Mutex<Relays>,
    candidates: Mutex<CandidateBuffer>,
    /// Single-slot renegotiation trigger
    negotiation: Notify,
    restart_pending: AtomicBool,
    closed: CancellationToken,
    torn_down: AtomicBool,
}

impl Peer {
    /// Create a peer together with the receiving end of its outbound queue
    pub fn new(
        id: PeerId,
        room_id: RoomId,
        name: Option<String>,
        connection: Arc<dyn MediaConnection>,
        config: &SfuConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SignalMessage>) {
        let (tx, rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let peer = Arc::new(Self {
            id,
            room_id,
            name,
            connection,
            outbound: Mutex::new(Some(tx)),
            relays: Mutex::new(Relays::default()),
            candidates: Mutex::new(CandidateBuffer::new(config.candidate_queue_max.max(1))),
            negotiation: Notify::new(),
            restart_pending: AtomicBool::new(false),
            closed: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
        });
        (peer, rx)
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.connection
    }

    /// Queue a message for the signaling writer without blocking
    pub fn try_send(&self, message: SignalMessage) -> Result<()> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or_else(|| SfuError::PeerClosed(self.id.clone()))?;
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SfuError::QueueFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => SfuError::PeerClosed(self.id.clone()),
        })
    }

    /// Like [`Peer::try_send`], but a failure is logged and the message dropped
    pub fn send(&self, message: SignalMessage) {
        let kind = message.kind;
        match self.try_send(message) {
            Ok(()) => {}
            Err(SfuError::QueueFull(_)) => {
                warn!(peer_id = %self.id, kind = ?kind, "Send queue full, dropping message");
            }
            Err(e) => debug!(peer_id = %self.id, kind = ?kind, error = %e, "Dropping message"),
        }
    }

    /// Ask the negotiation worker for a new offer. Requests made while one is
    /// already pending collapse into it.
    pub fn request_negotiation(&self) {
        self.negotiation.notify_one();
    }

    /// Ask for an ICE restart offer; returns false if one is already pending
    pub fn request_ice_restart(&self) -> bool {
        if self
            .restart_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.negotiation.notify_one();
        true
    }

    pub(crate) fn negotiation_trigger(&self) -> &Notify {
        &self.negotiation
    }

    pub(crate) fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::Acquire)
    }

    pub(crate) fn clear_restart(&self) {
        self.restart_pending.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Fire the closed signal; every loop owned by this peer exits
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Close the outbound queue; the writer flushes what is queued and stops
    pub fn close_send_queue(&self) {
        self.outbound.lock().take();
    }

    /// First caller wins; later teardown attempts are no-ops
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn has_relay(&self, key: &SenderKey) -> bool {
        self.relays.lock().senders.contains_key(key)
    }

    /// Record a relay; false if one already exists for the key
    pub fn insert_relay(
        &self,
        key: SenderKey,
        kind: TrackKind,
        sender: Arc<dyn RelaySender>,
        track: Arc<dyn RelayTrack>,
    ) -> bool {
        let mut relays = self.relays.lock();
        if relays.senders.contains_key(&key) {
            return false;
        }
        relays.senders.insert(key.clone(), sender);
        relays.locals_mut(kind).insert(key, track);
        true
    }

    /// Remove a relay. Only the caller that gets `Some` may detach the sender.
    pub fn remove_relay(&self, key: &SenderKey) -> Option<(Arc<dyn RelaySender>, Arc<dyn RelayTrack>)> {
        let mut relays = self.relays.lock();
        let sender = relays.senders.remove(key)?;
        let track = relays
            .local_video
            .remove(key)
            .or_else(|| relays.local_audio.remove(key))?;
        Some((sender, track))
    }

    #[must_use]
    pub fn relay_track(&self, key: &SenderKey) -> Option<Arc<dyn RelayTrack>> {
        self.relays.lock().local(key).cloned()
    }

    #[must_use]
    pub fn relay_keys(&self) -> Vec<SenderKey> {
        self.relays.lock().senders.keys().cloned().collect()
    }

    /// Drop every relay without detaching; used when the connection itself goes away
    pub(crate) fn clear_relays(&self) -> usize {
        let mut relays = self.relays.lock();
        let count = relays.senders.len();
        *relays = Relays::default();
        count
    }

    /// Route one inbound signaling message
    pub async fn handle_signal(&self, message: SignalMessage) -> Flow {
        match message.kind {
            SignalKind::Offer => match message.offer {
                Some(offer) => self.handle_offer(offer).await,
                None => warn!(peer_id = %self.id, "Offer message without description"),
            },
            SignalKind::Answer => match message.answer {
                Some(answer) => self.handle_answer(answer).await,
                None => warn!(peer_id = %self.id, "Answer message without description"),
            },
            SignalKind::Candidate => match message.candidate {
                Some(Some(candidate)) => self.handle_candidate(candidate).await,
                Some(None) => debug!(peer_id = %self.id, "Remote end of candidates"),
                None => warn!(peer_id = %self.id, "Candidate message without candidate field"),
            },
            SignalKind::Leave => {
                info!(peer_id = %self.id, room_id = %self.room_id, "Peer requested leave");
                return Flow::Leave;
            }
            SignalKind::PeerLeft => {
                debug!(peer_id = %self.id, "Ignoring server-only message from client");
            }
        }
        Flow::Continue
    }

    async fn handle_offer(&self, offer: SessionDescription) {
        let mut rolled_back = false;
        self.answer_offer(offer, &mut rolled_back).await;

        // Whatever the outcome, a discarded local offer has to be re-issued
        if rolled_back {
            self.request_negotiation();
        }
    }

    async fn answer_offer(&self, offer: SessionDescription, rolled_back: &mut bool) {
        if self.connection.signaling_state() == SignalingState::HaveLocalOffer {
            // Glare: the client's offer wins, ours is re-issued afterwards
            debug!(peer_id = %self.id, "Offer collision, rolling back local offer");
            if !self.rollback_local_offer().await {
                return;
            }
            *rolled_back = true;
        }

        if let Err(e) = self.connection.set_remote_description(offer.clone()).await {
            // The worker may have committed an offer after the state check above
            let state = self.connection.signaling_state();
            if *rolled_back || state != SignalingState::HaveLocalOffer {
                warn!(peer_id = %self.id, error = %e, "Failed to apply remote offer");
                return;
            }
            debug!(peer_id = %self.id, error = %e, "Local offer committed concurrently, rolling back");
            if !self.rollback_local_offer().await {
                return;
            }
            *rolled_back = true;
            if let Err(e) = self.connection.set_remote_description(offer).await {
                warn!(peer_id = %self.id, error = %e, "Failed to apply remote offer after rollback");
                return;
            }
        }
        self.flush_candidates().await;

        let answer = match self.connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer_id = %self.id, error = %e, "Failed to create answer");
                return;
            }
        };
        if let Err(e) = self.connection.set_local_description(answer.clone()).await {
            warn!(peer_id = %self.id, error = %e, "Failed to apply local answer");
            return;
        }
        let answer = self.connection.local_description().await.unwrap_or(answer);
        self.send(SignalMessage::answer(answer));
    }

    async fn rollback_local_offer(&self) -> bool {
        match self.connection.rollback().await {
            Ok(()) => true,
            Err(e) => {
                warn!(peer_id = %self.id, error = %e, "Rollback failed, dropping remote offer");
                false
            }
        }
    }

    async fn handle_answer(&self, answer: SessionDescription) {
        let state = self.connection.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            debug!(peer_id = %self.id, state = ?state, "Ignoring answer outside have-local-offer");
            return;
        }
        if let Err(e) = self.connection.set_remote_description(answer).await {
            warn!(peer_id = %self.id, error = %e, "Failed to apply remote answer");
            return;
        }
        self.flush_candidates().await;
    }

    async fn handle_candidate(&self, candidate: IceCandidate) {
        let ready = self.candidates.lock().push(candidate);
        match ready {
            Some(candidate) => self.apply_candidate(candidate).await,
            None => trace!(peer_id = %self.id, "Buffered remote candidate"),
        }
    }

    async fn flush_candidates(&self) {
        let pending = self.candidates.lock().mark_remote_set();
        if !pending.is_empty() {
            debug!(peer_id = %self.id, count = pending.len(), "Applying buffered candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            debug!(peer_id = %self.id, error = %e, "Failed to add remote candidate");
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnection;
    use futures::FutureExt;

    fn peer_with_capacity(capacity: usize) -> (Arc<Peer>, mpsc::Receiver<SignalMessage>) {
        let config = SfuConfig {
            send_queue_capacity: capacity,
            ..Default::default()
        };
        Peer::new(PeerId::from("a"), RoomId::from("r1"), None, FakeConnection::new(), &config)
    }

    #[test]
    fn test_send_after_close_is_a_drop() {
        let (peer, _rx) = peer_with_capacity(4);
        peer.close_send_queue();

        assert!(matches!(peer.try_send(SignalMessage::leave()), Err(SfuError::PeerClosed(_))));
        peer.send(SignalMessage::leave());
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (peer, mut rx) = peer_with_capacity(1);
        peer.try_send(SignalMessage::leave()).unwrap();

        assert!(matches!(peer.try_send(SignalMessage::leave()), Err(SfuError::QueueFull(_))));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ice_restart_single_flight() {
        let (peer, _rx) = peer_with_capacity(4);
        assert!(peer.request_ice_restart());
        assert!(!peer.request_ice_restart());
        peer.clear_restart();
        assert!(peer.request_ice_restart());
    }

    #[tokio::test]
    async fn test_relay_bookkeeping() {
        let (peer, _rx) = peer_with_capacity(4);
        let key = SenderKey::new(PeerId::from("b"), crate::types::TrackId::from("v"));
        let track: Arc<dyn RelayTrack> = Arc::new(crate::testing::FakeRelayTrack::default());
        let attachment = FakeConnection::new()
            .add_relay_track(crate::media::RelaySpec {
                codec: Default::default(),
                track_id: "v".to_string(),
                stream_id: "b".to_string(),
            })
            .await
            .unwrap();

        assert!(peer.insert_relay(key.clone(), TrackKind::Video, attachment.sender.clone(), track.clone()));
        assert!(!peer.insert_relay(key.clone(), TrackKind::Video, attachment.sender, track));
        assert!(peer.relay_track(&key).is_some());
        assert_eq!(peer.relay_keys(), vec![key.clone()]);

        assert!(peer.remove_relay(&key).is_some());
        assert!(peer.remove_relay(&key).is_none());
        assert!(!peer.has_relay(&key));
    }

    #[tokio::test]
    async fn test_offer_answered_when_local_offer_lands_mid_apply() {
        let connection = FakeConnection::new();
        let (peer, mut rx) = Peer::new(
            PeerId::from("a"),
            RoomId::from("r1"),
            None,
            connection.clone(),
            &SfuConfig::default(),
        );
        connection.commit_offer_before_next_remote();

        let flow = peer
            .handle_signal(SignalMessage::offer(SessionDescription::offer("client-offer")))
            .await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(connection.rollbacks(), 1);
        assert_eq!(connection.state(), SignalingState::Stable);
        assert_eq!(rx.try_recv().unwrap().kind, SignalKind::Answer);
        // The discarded local offer is queued for the worker again
        assert!(peer.negotiation_trigger().notified().now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_offer_in_stable_needs_no_renegotiation() {
        let connection = FakeConnection::new();
        let (peer, mut rx) = Peer::new(
            PeerId::from("a"),
            RoomId::from("r1"),
            None,
            connection.clone(),
            &SfuConfig::default(),
        );

        peer.handle_signal(SignalMessage::offer(SessionDescription::offer("client-offer")))
            .await;

        assert_eq!(connection.rollbacks(), 0);
        assert_eq!(rx.try_recv().unwrap().kind, SignalKind::Answer);
        assert!(peer.negotiation_trigger().notified().now_or_never().is_none());
    }

    #[test]
    fn test_candidate_buffer_drops_oldest() {
        let mut buffer = CandidateBuffer::new(2);
        assert!(buffer.push(IceCandidate::new("a")).is_none());
        assert!(buffer.push(IceCandidate::new("b")).is_none());
        assert!(buffer.push(IceCandidate::new("c")).is_none());

        let flushed: Vec<_> = buffer.mark_remote_set().into_iter().map(|c| c.candidate).collect();
        assert_eq!(flushed, vec!["b", "c"]);
    }

    #[test]
    fn test_candidate_buffer_passes_through_after_remote_set() {
        let mut buffer = CandidateBuffer::new(4);
        buffer.mark_remote_set();
        let ready = buffer.push(IceCandidate::new("a")).unwrap();
        assert_eq!(ready.candidate, "a");
        assert!(buffer.mark_remote_set().is_empty());
    }
}
