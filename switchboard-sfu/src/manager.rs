//! Room registry
//!
//! The registry is an explicitly owned value handed to whatever accepts
//! signaling connections. It maps room ids to rooms and carries the
//! configuration and connection factory every session needs.
//! Rooms are kept once created, even with no peers left.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::SfuConfig;
use crate::media::ConnectionFactory;
use crate::room::{Room, RoomStats};
use crate::types::RoomId;

pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    factory: Arc<dyn ConnectionFactory>,
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl RoomRegistry {
    pub fn new(config: SfuConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        info!(
            ice_servers = config.ice_servers.len(),
            negotiation_debounce_ms = config.negotiation_debounce_ms,
            max_peers_per_room = config.max_peers_per_room,
            "Room registry initialized"
        );

        Arc::new(Self {
            config: Arc::new(config),
            factory,
            rooms: DashMap::new(),
        })
    }

    /// Get or create a room. Concurrent callers for the same id always get
    /// the same instance.
    pub fn get_or_create_room(&self, room_id: RoomId) -> Arc<Room> {
        match self.rooms.entry(room_id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let room = Arc::new(Room::new(
                    entry.key().clone(),
                    self.config.max_peers_per_room,
                ));
                info!(room_id = %room.id, "Created new room");
                Arc::clone(entry.insert(room).value())
            }
        }
    }

    #[must_use]
    pub fn get_room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|room| Arc::clone(room.value()))
    }

    #[must_use]
    pub fn room_stats(&self, room_id: &RoomId) -> Option<RoomStats> {
        self.get_room(room_id).map(|room| room.stats())
    }

    /// Get list of all room IDs
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    /// Fire the closed signal of every connected peer; their sessions then
    /// tear themselves down
    pub fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| Arc::clone(r.value())).collect();
        let mut peers = 0;
        for room in rooms {
            for peer in room.peers() {
                peer.close();
                peers += 1;
            }
        }
        info!(rooms = self.rooms.len(), peers, "Room registry shutting down");
    }
}
