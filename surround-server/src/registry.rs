//! Room registry
//!
//! Owns every live room. Lock order is always registry map, then room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use surround_core::network::RoomId;
use surround_core::sync::RoomSummary;
use surround_core::time::LocalClock;
use tracing::info;
use uuid::Uuid;

use crate::coordinator::{Outbound, RoomCoordinator};
use crate::spatial::{self, SpatialTiming};

pub type SharedRoom = Arc<Mutex<RoomCoordinator>>;

/// A member's handle on the room it joined
pub struct Membership {
    pub client_id: String,
    pub room: SharedRoom,
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, SharedRoom>>,
    clock: Arc<dyn LocalClock>,
    schedule_lead: Duration,
    spatial: SpatialTiming,
    connections: AtomicUsize,
}

impl RoomRegistry {
    pub fn new(clock: Arc<dyn LocalClock>, schedule_lead: Duration, spatial: SpatialTiming) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            clock,
            schedule_lead,
            spatial,
            connections: AtomicUsize::new(0),
        }
    }

    /// Server time in milliseconds since the UNIX epoch
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn new_room(&self, room_id: &RoomId) -> SharedRoom {
        Arc::new(Mutex::new(RoomCoordinator::new(
            room_id.as_str().to_string(),
            Arc::clone(&self.clock),
            self.schedule_lead,
        )))
    }

    /// Join `room_id`, creating the room on first join
    pub fn join(&self, room_id: &RoomId, username: Option<String>, outbound: Outbound) -> Membership {
        let client_id = Uuid::new_v4().to_string();

        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!("Room {} created", room_id);
                self.new_room(room_id)
            })
            .clone();
        room.lock().join(client_id.clone(), username, outbound);
        drop(rooms);

        self.connections.fetch_add(1, Ordering::Relaxed);
        Membership { client_id, room }
    }

    /// Leave `room_id`. Destroys the room when its last member leaves.
    /// Returns true if the room was destroyed.
    pub fn leave(&self, room_id: &RoomId, client_id: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };

        let mut coordinator = room.lock();
        if coordinator.leave(client_id) {
            self.connections.fetch_sub(1, Ordering::Relaxed);
        }
        if !coordinator.is_empty() {
            return false;
        }

        coordinator.shutdown();
        drop(coordinator);
        rooms.remove(room_id);
        info!("Room {} destroyed", room_id);
        true
    }

    /// Create an empty room under a fresh random id
    pub fn create_room(&self) -> RoomId {
        let mut rooms = self.rooms.lock();
        let room_id = loop {
            let candidate = RoomId::random();
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        rooms.insert(room_id.clone(), self.new_room(&room_id));
        info!("Room {} created (empty)", room_id);
        room_id
    }

    pub fn room(&self, room_id: &RoomId) -> Option<SharedRoom> {
        self.rooms.lock().get(room_id).cloned()
    }

    pub fn summary(&self, room_id: &RoomId) -> Option<RoomSummary> {
        let room = self.room(room_id)?;
        let summary = room.lock().summary();
        Some(summary)
    }

    /// Summaries of every room, oldest first
    pub fn list(&self) -> Vec<RoomSummary> {
        let rooms: Vec<SharedRoom> = self.rooms.lock().values().cloned().collect();
        let mut summaries: Vec<RoomSummary> = rooms.iter().map(|room| room.lock().summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.room_id.cmp(&b.room_id)));
        summaries
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Start spatial audio in `room`. Idempotent.
    pub fn start_spatial(&self, room: &SharedRoom) -> bool {
        spatial::start(room, self.spatial)
    }

    /// Cancel every room's background work and forget all rooms
    pub fn shutdown(&self) {
        let mut rooms = self.rooms.lock();
        for room in rooms.values() {
            room.lock().shutdown();
        }
        info!("Registry shut down ({} rooms)", rooms.len());
        rooms.clear();
    }
}
