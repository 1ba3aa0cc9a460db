//! Peer session lifecycle
//!
//! A session is everything that happens between a signaling connection
//! being accepted and the peer being torn down:
//!
//! - the reader loop (this task) routing inbound messages to the peer
//! - one writer task, the only thing that writes to the transport
//! - one negotiation worker
//! - one event task consuming media connection events
//!
//! All of them stop on the peer's closed signal. Teardown always runs from
//! the reader side, whichever of them noticed the failure first.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SfuError};
use crate::manager::RoomRegistry;
use crate::media::{ConnectionEvent, ConnectionEvents, ConnectionState, IceState};
use crate::negotiation;
use crate::peer::{Flow, Peer};
use crate::room::Room;
use crate::signal::SignalMessage;
use crate::track;
use crate::types::{PeerId, RoomId};

/// Inbound half of a signaling connection
#[async_trait]
pub trait SignalingStream: Send {
    /// Next text message; `None` once the connection is closed.
    /// Read failures are reported as [`SfuError::Transport`].
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// Outbound half of a signaling connection
#[async_trait]
pub trait SignalingSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self);
}

/// Connection request parameters
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: RoomId,
    /// Generated when absent
    pub peer_id: Option<PeerId>,
    pub name: Option<String>,
}

/// Run one peer from join to teardown. Returns once the peer has left and
/// its signaling connection is closed.
pub async fn run<S, K>(
    registry: Arc<RoomRegistry>,
    request: JoinRequest,
    mut stream: S,
    mut sink: K,
) -> Result<()>
where
    S: SignalingStream,
    K: SignalingSink + 'static,
{
    let config = registry.config().clone();
    let room = registry.get_or_create_room(request.room_id);
    let peer_id = request.peer_id.unwrap_or_else(PeerId::generate);

    if room.contains_peer(&peer_id) {
        sink.close().await;
        return Err(SfuError::DuplicatePeer {
            room_id: room.id.clone(),
            peer_id,
        });
    }

    let (connection, events) = match registry.factory().create().await {
        Ok(created) => created,
        Err(e) => {
            sink.close().await;
            return Err(e);
        }
    };
    let (peer, outbound) = Peer::new(
        peer_id,
        room.id.clone(),
        request.name,
        connection,
        &config,
    );

    let writer = tokio::spawn(write_loop(Arc::clone(&peer), outbound, sink));
    let worker = negotiation::spawn(Arc::clone(&peer), &config);
    tokio::spawn(event_loop(
        Arc::clone(&room),
        Arc::clone(&peer),
        events,
        config.relay_keyframe_requests,
    ));

    if let Err(e) = room.add_peer(Arc::clone(&peer)) {
        warn!(room_id = %room.id, peer_id = %peer.id, error = %e, "Join rejected");
        peer.close();
        peer.close_send_queue();
        if let Err(e) = peer.connection().close().await {
            debug!(peer_id = %peer.id, error = %e, "Error closing media connection");
        }
        join_task(&peer.id, "writer", writer).await;
        join_task(&peer.id, "negotiation worker", worker).await;
        return Err(e);
    }

    info!(
        room_id = %room.id,
        peer_id = %peer.id,
        name = peer.name.as_deref().unwrap_or(""),
        "Peer session started"
    );
    track::attach_existing(&room, &peer, config.relay_keyframe_requests).await;

    read_loop(&peer, &mut stream).await;
    teardown(&room, &peer).await;

    join_task(&peer.id, "negotiation worker", worker).await;
    join_task(&peer.id, "writer", writer).await;
    info!(room_id = %room.id, peer_id = %peer.id, "Peer session ended");
    Ok(())
}

async fn join_task(peer_id: &PeerId, task: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(peer_id = %peer_id, task, error = %e, "Peer task panicked");
    }
}

async fn read_loop<S: SignalingStream>(peer: &Peer, stream: &mut S) {
    let closed = peer.closed_token();

    loop {
        let received = tokio::select! {
            () = closed.cancelled() => break,
            received = stream.recv() => received,
        };

        let text = match received {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                info!(peer_id = %peer.id, error = %e, "Signaling read failed");
                break;
            }
            None => {
                debug!(peer_id = %peer.id, "Signaling connection closed");
                break;
            }
        };

        let message = match SignalMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer_id = %peer.id, error = %e, "Dropping malformed signaling message");
                continue;
            }
        };

        if peer.handle_signal(message).await == Flow::Leave {
            break;
        }
    }
}

/// The single writer: drains the send queue in order until it is closed
async fn write_loop<K: SignalingSink>(
    peer: Arc<Peer>,
    mut outbound: mpsc::Receiver<SignalMessage>,
    mut sink: K,
) {
    while let Some(message) = outbound.recv().await {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(peer_id = %peer.id, error = %e, "Failed to encode signaling message");
                continue;
            }
        };
        if let Err(e) = sink.send(text).await {
            info!(peer_id = %peer.id, error = %e, "Signaling write failed");
            peer.close();
            break;
        }
    }
    sink.close().await;
}

/// Turns media connection events into peer and room actions
async fn event_loop(
    room: Arc<Room>,
    peer: Arc<Peer>,
    mut events: ConnectionEvents,
    relay_keyframes: bool,
) {
    let closed = peer.closed_token();

    loop {
        let event = tokio::select! {
            () = closed.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ConnectionEvent::Candidate(candidate) => {
                peer.send(SignalMessage::candidate(candidate));
            }
            ConnectionEvent::Track(remote) => {
                let room = Arc::clone(&room);
                let peer = Arc::clone(&peer);
                tokio::spawn(async move {
                    track::publish(&room, &peer, remote, relay_keyframes).await;
                });
            }
            ConnectionEvent::IceState(state) => {
                debug!(peer_id = %peer.id, state = ?state, "ICE state changed");
                if matches!(state, IceState::Disconnected | IceState::Failed)
                    && peer.request_ice_restart()
                {
                    info!(peer_id = %peer.id, state = ?state, "Requesting ICE restart");
                }
            }
            ConnectionEvent::ConnectionState(state) => {
                debug!(peer_id = %peer.id, state = ?state, "Connection state changed");
                if matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
                    info!(peer_id = %peer.id, state = ?state, "Media connection lost");
                    peer.close();
                    break;
                }
            }
        }
    }
}

/// Remove a peer from its room and release everything it holds.
/// Only the first call for a peer does anything.
pub async fn teardown(room: &Room, peer: &Peer) {
    if !peer.begin_teardown() {
        return;
    }

    peer.close();
    room.remove_peer(&peer.id);

    for published in room.published_by(&peer.id) {
        track::end_track(room, &published).await;
    }

    room.broadcast_except(&peer.id, &SignalMessage::peer_left(peer.id.clone()));
    peer.close_send_queue();

    let relays = peer.clear_relays();
    if let Err(e) = peer.connection().close().await {
        debug!(peer_id = %peer.id, error = %e, "Error closing media connection");
    }
    debug!(room_id = %room.id, peer_id = %peer.id, relays, "Peer torn down");
}
