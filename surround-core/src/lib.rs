//! Surround - Core Library
//!
//! Client side of synchronized multi-device room playback: clock sync against
//! the room server, scheduled execution of server actions, spatial gain math,
//! and the wire protocol shared with the server.

pub mod clock;
pub mod network;
pub mod playback;
pub mod session;
pub mod spatial;
pub mod sync;
pub mod time;

// Re-exports for convenience
pub use clock::{ClockSyncEngine, SyncQuality};
pub use session::{Session, SessionCallback, SessionConfig, SessionError};
pub use sync::{ClientMessage, RoomState, ScheduledAction, ServerMessage};
