//! Networking
//!
//! WebSocket link to the room server plus the HTTP room directory.

mod connection;
mod directory;
mod room_code;

pub use connection::{
    ws_url, ConnectionCommand, ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager,
    DEFAULT_RECONNECT_DELAY, MAX_FRAME_BYTES,
};
pub use directory::{DirectoryError, RoomDirectory};
pub use room_code::RoomId;
