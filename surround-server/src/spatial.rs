//! Spatial gain scheduler
//!
//! While spatial audio is active a room runs one ticker task. Every tick
//! recomputes member gains against the listening source and schedules them a
//! short lead ahead. The task only holds a weak handle, so a destroyed room
//! ends it even if the cancel signal never arrives.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::coordinator::RoomCoordinator;

/// Tick and lead of the gain broadcasts
#[derive(Debug, Clone, Copy)]
pub struct SpatialTiming {
    pub tick: Duration,
    pub lead: Duration,
}

impl Default for SpatialTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            lead: Duration::from_millis(100),
        }
    }
}

/// Start the ticker for `room`. Idempotent: returns false if one is already
/// running.
pub fn start(room: &Arc<Mutex<RoomCoordinator>>, timing: SpatialTiming) -> bool {
    let mut coordinator = room.lock();
    if coordinator.spatial_running() {
        debug!("Spatial ticker already running for room {}", coordinator.room_id());
        return false;
    }

    let (cancel_tx, cancel_rx) = oneshot::channel();
    coordinator.set_spatial_cancel(cancel_tx);
    info!(
        "Room {}: spatial audio started ({}ms tick)",
        coordinator.room_id(),
        timing.tick.as_millis()
    );

    tokio::spawn(run_ticker(Arc::downgrade(room), timing, cancel_rx));
    true
}

async fn run_ticker(
    room: Weak<Mutex<RoomCoordinator>>,
    timing: SpatialTiming,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + timing.tick, timing.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Fires on cancel and when the coordinator drops the sender
            _ = &mut cancel_rx => break,
            _ = ticker.tick() => {
                let Some(room) = room.upgrade() else {
                    break;
                };
                room.lock().broadcast_spatial_gains(timing.lead);
            }
        }
    }
    debug!("Spatial ticker finished");
}
