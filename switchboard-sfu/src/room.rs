//! SFU Room management
//!
//! A room holds its peers and the tracks they publish under a single
//! room-scoped lock. The lock only guards map mutations; every operation
//! that does I/O works on a snapshot taken with [`Room::other_peers`] or
//! [`Room::existing_published_tracks`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SfuError};
use crate::peer::Peer;
use crate::signal::SignalMessage;
use crate::track::{PublishedTrack, TrackStats};
use crate::types::{PeerId, RoomId, TrackId};

#[derive(Default)]
struct RoomState {
    peers: HashMap<PeerId, Arc<Peer>>,
    published_tracks: HashMap<PeerId, HashMap<TrackId, Arc<PublishedTrack>>>,
}

pub struct Room {
    pub id: RoomId,
    /// 0 = unlimited
    max_peers: usize,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new(id: RoomId, max_peers: usize) -> Self {
        Self {
            id,
            max_peers,
            state: RwLock::new(RoomState::default()),
        }
    }

    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<()> {
        let mut state = self.state.write();
        if state.peers.contains_key(&peer.id) {
            return Err(SfuError::DuplicatePeer {
                room_id: self.id.clone(),
                peer_id: peer.id.clone(),
            });
        }
        if self.max_peers > 0 && state.peers.len() >= self.max_peers {
            return Err(SfuError::RoomFull {
                room_id: self.id.clone(),
                max_peers: self.max_peers,
            });
        }

        let peer_id = peer.id.clone();
        state.peers.insert(peer_id.clone(), peer);
        info!(room_id = %self.id, peer_id = %peer_id, peer_count = state.peers.len(), "Peer joined room");
        Ok(())
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        let mut state = self.state.write();
        let removed = state.peers.remove(peer_id);
        if removed.is_some() {
            info!(room_id = %self.id, peer_id = %peer_id, peer_count = state.peers.len(), "Peer left room");
        }
        removed
    }

    #[must_use]
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.state.read().peers.get(peer_id).cloned()
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.state.read().peers.contains_key(peer_id)
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.state.read().peers.values().cloned().collect()
    }

    /// Snapshot of every peer except `except`
    #[must_use]
    pub fn other_peers(&self, except: &PeerId) -> Vec<Arc<Peer>> {
        self.state
            .read()
            .peers
            .iter()
            .filter(|(id, _)| *id != except)
            .map(|(_, peer)| Arc::clone(peer))
            .collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.read().peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().peers.is_empty()
    }

    /// Returns false if the publisher already has a track with this id
    pub fn register_published_track(&self, track: Arc<PublishedTrack>) -> bool {
        let mut state = self.state.write();
        let tracks = state.published_tracks.entry(track.publisher.clone()).or_default();
        if tracks.contains_key(&track.id) {
            return false;
        }
        tracks.insert(track.id.clone(), track);
        true
    }

    /// Idempotent; only the first call for a track gets it back
    pub fn unregister_published_track(
        &self,
        publisher: &PeerId,
        track_id: &TrackId,
    ) -> Option<Arc<PublishedTrack>> {
        let mut state = self.state.write();
        let tracks = state.published_tracks.get_mut(publisher)?;
        let removed = tracks.remove(track_id);
        if tracks.is_empty() {
            state.published_tracks.remove(publisher);
        }
        if removed.is_some() {
            debug!(room_id = %self.id, publisher = %publisher, track_id = %track_id, "Unregistered track");
        }
        removed
    }

    /// Snapshot of every published track in the room
    #[must_use]
    pub fn existing_published_tracks(&self) -> Vec<Arc<PublishedTrack>> {
        self.state
            .read()
            .published_tracks
            .values()
            .flat_map(|tracks| tracks.values().cloned())
            .collect()
    }

    /// Snapshot of the tracks published by one peer
    #[must_use]
    pub fn published_by(&self, publisher: &PeerId) -> Vec<Arc<PublishedTrack>> {
        self.state
            .read()
            .published_tracks
            .get(publisher)
            .map(|tracks| tracks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a message to every peer except `except`
    pub fn broadcast_except(&self, except: &PeerId, message: &SignalMessage) {
        for peer in self.other_peers(except) {
            peer.send(message.clone());
        }
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let tracks: Vec<TrackStats> = self
            .existing_published_tracks()
            .iter()
            .map(|track| track.stats())
            .collect();

        RoomStats {
            room_id: self.id.to_string(),
            peer_count: self.peer_count(),
            published_tracks: tracks.len(),
            packets_forwarded: tracks.iter().map(|t| t.packets_forwarded).sum(),
            bytes_forwarded: tracks.iter().map(|t| t.bytes_forwarded).sum(),
            tracks,
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("peer_count", &self.peer_count())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomStats {
    pub room_id: String,
    pub peer_count: usize,
    pub published_tracks: usize,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub tracks: Vec<TrackStats>,
}
