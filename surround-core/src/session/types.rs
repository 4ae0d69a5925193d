//! Session configuration, errors and the callback interface

use std::time::Duration;

use crate::clock::{SyncStatus, PROBE_CEILING, PROBE_INTERVAL};
use crate::network::{ConnectionError, DirectoryError, DEFAULT_RECONNECT_DELAY};
use crate::playback::{PlaybackError, PlaybackPhase};
use crate::sync::{ClientInfo, RoomView};

/// Errors surfaced by [`super::Session`]
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Not in a room")]
    NotInRoom,

    #[error("No track selected")]
    NoTrackSelected,

    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

/// Client session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// HTTP origin of the room server
    pub server_url: String,
    pub probe_interval: Duration,
    /// Responses per sync round before probing stops
    pub probe_ceiling: usize,
    /// Reconnect interval after an abnormal close
    pub reconnect_delay: Duration,
    /// Check the room exists over HTTP before opening the socket
    pub validate_join: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            probe_interval: PROBE_INTERVAL,
            probe_ceiling: PROBE_CEILING,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            validate_join: true,
        }
    }
}

/// Callback interface for session events
pub trait SessionCallback: Send + Sync {
    /// Room snapshot received, on first connect and after every reconnect
    fn on_connected(&self, room: RoomView);
    fn on_clients_changed(&self, clients: Vec<ClientInfo>);
    /// `changed_by` is the member who picked the track
    fn on_track_changed(&self, audio_id: String, changed_by: Option<String>);
    fn on_audio_source_added(&self, audio_id: String, name: String);
    fn on_playback_changed(&self, phase: PlaybackPhase, audio_id: Option<String>);
    /// Called when a clock sync round completes
    fn on_sync_status(&self, status: SyncStatus);
    fn on_error(&self, message: String);
    fn on_disconnected(&self, will_retry: bool);
}
