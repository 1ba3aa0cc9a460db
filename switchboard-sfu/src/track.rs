//! Track fanout pipeline
//!
//! Each published track gets one forwarding task that copies RTP packets
//! from the publisher to a relay track on every other peer in the room.
//! Relay tracks are looked up by [`SenderKey`] per packet, so peers joining
//! or leaving never need to touch a running forwarding loop.
//!
//! Cleanup is idempotent per key: the forwarding loop ending and the
//! publisher leaving may both run [`end_track`] for the same track, and only
//! the first removal of each subscriber entry detaches a sender and requests
//! renegotiation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::error::Result;
use crate::media::{Feedback, InboundTrack, MediaConnection, RelaySender, RelaySpec};
use crate::peer::Peer;
use crate::room::Room;
use crate::types::{PeerId, SenderKey, TrackId};

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Forwarding counters, updated lock-free by the forwarding task
#[derive(Default)]
struct TrackStatsInner {
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackStats {
    pub publisher: String,
    pub track_id: String,
    pub kind: Option<TrackKind>,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub write_errors: u64,
}

/// One inbound track from one publisher
pub struct PublishedTrack {
    pub publisher: PeerId,
    pub id: TrackId,
    pub kind: TrackKind,
    remote: Arc<dyn InboundTrack>,
    /// Publisher's connection, for relaying keyframe requests
    publisher_connection: Arc<dyn MediaConnection>,
    /// Cancelled once cleanup of this track has started
    ended: CancellationToken,
    stats: TrackStatsInner,
}

impl PublishedTrack {
    pub fn new(
        publisher: PeerId,
        remote: Arc<dyn InboundTrack>,
        publisher_connection: Arc<dyn MediaConnection>,
    ) -> Self {
        Self {
            publisher,
            id: remote.id(),
            kind: remote.kind(),
            remote,
            publisher_connection,
            ended: CancellationToken::new(),
            stats: TrackStatsInner::default(),
        }
    }

    #[must_use]
    pub fn key(&self) -> SenderKey {
        SenderKey::new(self.publisher.clone(), self.id.clone())
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    fn relay_spec(&self) -> RelaySpec {
        RelaySpec {
            codec: self.remote.codec(),
            track_id: self.id.to_string(),
            stream_id: self.publisher.to_string(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> TrackStats {
        TrackStats {
            publisher: self.publisher.to_string(),
            track_id: self.id.to_string(),
            kind: Some(self.kind),
            packets_forwarded: self.stats.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.stats.bytes_forwarded.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle a track newly received from `publisher`
pub async fn publish(
    room: &Arc<Room>,
    publisher: &Arc<Peer>,
    remote: Arc<dyn InboundTrack>,
    relay_keyframes: bool,
) {
    if publisher.is_closed() {
        return;
    }
    let track = Arc::new(PublishedTrack::new(
        publisher.id.clone(),
        remote,
        Arc::clone(publisher.connection()),
    ));
    let key = track.key();

    if !room.register_published_track(Arc::clone(&track)) {
        warn!(room_id = %room.id, key = %key, "Track already published, ignoring duplicate");
        return;
    }

    info!(
        room_id = %room.id,
        publisher = %track.publisher,
        track_id = %track.id,
        kind = ?track.kind,
        "Track published"
    );

    for subscriber in room.other_peers(&track.publisher) {
        match attach(&subscriber, &track, relay_keyframes).await {
            Ok(true) => subscriber.request_negotiation(),
            Ok(false) => {}
            Err(e) => warn!(
                room_id = %room.id,
                key = %key,
                subscriber = %subscriber.id,
                error = %e,
                "Failed to attach relay track, skipping subscriber"
            ),
        }
    }

    let room = Arc::clone(room);
    tokio::spawn(async move {
        forward(&room, &track).await;
        end_track(&room, &track).await;
    });
}

/// Attach every track already flowing in the room to a newly joined peer,
/// followed by a single renegotiation request
pub async fn attach_existing(room: &Room, peer: &Arc<Peer>, relay_keyframes: bool) -> usize {
    let mut attached = 0;
    for track in room.existing_published_tracks() {
        if track.publisher == peer.id {
            continue;
        }
        match attach(peer, &track, relay_keyframes).await {
            Ok(true) => attached += 1,
            Ok(false) => {}
            Err(e) => warn!(
                room_id = %room.id,
                key = %track.key(),
                subscriber = %peer.id,
                error = %e,
                "Failed to attach existing track"
            ),
        }
    }

    if attached > 0 {
        debug!(room_id = %room.id, peer_id = %peer.id, attached, "Attached existing tracks");
        peer.request_negotiation();
    }
    attached
}

/// Create a relay track for `track` on `subscriber`'s connection.
///
/// `Ok(false)` means nothing new was attached.
async fn attach(
    subscriber: &Arc<Peer>,
    track: &Arc<PublishedTrack>,
    relay_keyframes: bool,
) -> Result<bool> {
    let key = track.key();
    if subscriber.is_closed() || track.is_ended() || subscriber.has_relay(&key) {
        return Ok(false);
    }

    let attachment = subscriber
        .connection()
        .add_relay_track(track.relay_spec())
        .await?;
    let sender = Arc::clone(&attachment.sender);

    if !subscriber.insert_relay(key.clone(), track.kind, attachment.sender, attachment.track) {
        // Lost a race against another attach of the same key
        if let Err(e) = sender.detach().await {
            debug!(key = %key, subscriber = %subscriber.id, error = %e, "Duplicate sender detach failed");
        }
        return Ok(false);
    }

    // Cleanup may have scanned this subscriber before the insert landed
    if subscriber.is_closed() || track.is_ended() {
        detach(subscriber, &key).await;
        return Ok(false);
    }

    spawn_feedback_relay(
        subscriber,
        sender,
        track,
        relay_keyframes && track.kind == TrackKind::Video,
    );
    trace!(key = %key, subscriber = %subscriber.id, "Relay track attached");
    Ok(true)
}

/// Remove one relay from a subscriber; a no-op if it is already gone
async fn detach(subscriber: &Peer, key: &SenderKey) -> bool {
    let Some((sender, local)) = subscriber.remove_relay(key) else {
        return false;
    };
    // Sender leaves the connection before the local track is released
    if let Err(e) = sender.detach().await {
        debug!(key = %key, subscriber = %subscriber.id, error = %e, "Sender detach failed");
    }
    drop(local);
    subscriber.request_negotiation();
    true
}

/// Copy packets until the inbound track fails or cleanup starts
async fn forward(room: &Room, track: &PublishedTrack) {
    let key = track.key();

    loop {
        let packet = tokio::select! {
            () = track.ended.cancelled() => break,
            read = track.remote.read_packet() => match read {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(key = %key, error = %e, "Track read ended");
                    break;
                }
            },
        };

        let size = packet.payload.len() as u64;
        for subscriber in room.other_peers(&track.publisher) {
            let Some(local) = subscriber.relay_track(&key) else {
                continue;
            };
            match local.write_packet(&packet).await {
                Ok(()) => {
                    track.stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                    track.stats.bytes_forwarded.fetch_add(size, Ordering::Relaxed);
                }
                Err(e) => {
                    track.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, subscriber = %subscriber.id, error = %e, "Relay write failed");
                }
            }
        }
    }
}

/// Tear down a published track: unregister it and detach its relay from
/// every remaining peer. Safe to call any number of times.
pub async fn end_track(room: &Room, track: &PublishedTrack) {
    track.ended.cancel();
    let key = track.key();
    let was_registered = room.unregister_published_track(&track.publisher, &track.id).is_some();

    let mut detached = 0usize;
    for subscriber in room.other_peers(&track.publisher) {
        if detach(&subscriber, &key).await {
            detached += 1;
        }
    }

    if was_registered || detached > 0 {
        info!(
            room_id = %room.id,
            key = %key,
            detached,
            stats = ?track.stats(),
            "Track ended"
        );
    }
}

/// Drain RTCP from a subscriber's sender, turning keyframe requests into a
/// PLI towards the publisher. Draining also keeps the sender's interceptors
/// running, so it runs for every relay.
fn spawn_feedback_relay(
    subscriber: &Peer,
    sender: Arc<dyn RelaySender>,
    track: &Arc<PublishedTrack>,
    relay_keyframes: bool,
) {
    let closed = subscriber.closed_token();
    let track = Arc::clone(track);

    tokio::spawn(async move {
        loop {
            let feedback = tokio::select! {
                () = closed.cancelled() => break,
                () = track.ended.cancelled() => break,
                read = sender.read_feedback() => match read {
                    Ok(feedback) => feedback,
                    Err(_) => break,
                },
            };

            let wants_keyframe = feedback
                .iter()
                .any(|f| matches!(f, Feedback::PictureLoss | Feedback::FullIntraRequest));
            if relay_keyframes && wants_keyframe {
                if let Err(e) = track
                    .publisher_connection
                    .request_keyframe(track.remote.ssrc())
                    .await
                {
                    debug!(key = %track.key(), error = %e, "Keyframe request failed");
                }
            }
        }
    });
}
