//! Room State Management

use std::f64::consts::PI;

use super::protocol::{ClientInfo, Position, RoomInfo, RoomSummary};

/// Radius of the circle members are laid out on
pub const LAYOUT_RADIUS: f64 = 25.0;

/// A connected member of a room
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub client_id: String,
    pub username: String,
    pub position: Position,
    pub is_active: bool,
    /// Last round trip observed by the server, in milliseconds
    pub rtt_ms: f64,
}

impl Member {
    pub fn new(client_id: String, username: String) -> Self {
        Self {
            client_id,
            username,
            position: Position::CENTER,
            is_active: true,
            rtt_ms: 0.0,
        }
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            position: self.position,
            is_active: self.is_active,
            rtt: self.rtt_ms,
        }
    }
}

/// An uploaded audio file, kept as raw encoded bytes
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSource {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
    pub uploaded_by: Option<String>,
    pub uploaded_at_ms: u64,
}

/// Authoritative state of one room
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    /// Members in join order
    pub members: Vec<Member>,
    pub current_track: Option<String>,
    pub is_playing: bool,
    /// Server instant the playback position is anchored to
    pub playback_start_time_ms: u64,
    /// Track position at `playback_start_time_ms`
    pub track_position_seconds: f64,
    pub listening_source: Position,
    pub spatial_active: bool,
    /// Sources in registration order
    pub audio_sources: Vec<AudioSource>,
    pub created_at_ms: u64,
}

impl RoomState {
    pub fn new(room_id: String, created_at_ms: u64) -> Self {
        Self {
            room_id,
            members: Vec::new(),
            current_track: None,
            is_playing: false,
            playback_start_time_ms: 0,
            track_position_seconds: 0.0,
            listening_source: Position::CENTER,
            spatial_active: false,
            audio_sources: Vec::new(),
            created_at_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, client_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.client_id == client_id)
    }

    pub fn member_mut(&mut self, client_id: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.client_id == client_id)
    }

    /// Add a member and relayout the roster
    pub fn add_member(&mut self, member: Member) {
        self.members.push(member);
        self.layout_members_in_circle();
    }

    /// Remove a member and relayout the roster
    pub fn remove_member(&mut self, client_id: &str) -> Option<Member> {
        let index = self.members.iter().position(|m| m.client_id == client_id)?;
        let removed = self.members.remove(index);
        self.layout_members_in_circle();
        Some(removed)
    }

    /// Place members evenly on a circle around the centre, in roster order.
    /// Member `i` of `n` sits at angle `i * 2π / n`.
    pub fn layout_members_in_circle(&mut self) {
        let n = self.members.len();
        for (i, member) in self.members.iter_mut().enumerate() {
            let angle = i as f64 * 2.0 * PI / n as f64;
            member.position = Position {
                x: Position::CENTER.x + LAYOUT_RADIUS * angle.cos(),
                y: Position::CENTER.y + LAYOUT_RADIUS * angle.sin(),
            };
        }
    }

    pub fn client_list(&self) -> Vec<ClientInfo> {
        self.members.iter().map(Member::info).collect()
    }

    /// Store an audio source. Re-uploading an id replaces it in place.
    pub fn register_audio_source(&mut self, source: AudioSource) {
        match self.audio_sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => *existing = source,
            None => self.audio_sources.push(source),
        }
    }

    pub fn has_audio_source(&self, audio_id: &str) -> bool {
        self.audio_sources.iter().any(|s| s.id == audio_id)
    }

    /// Track position in seconds at server instant `now_ms`.
    ///
    /// While playing this extrapolates from the anchor; before the anchor
    /// (an armed start) it stays at the anchored position.
    pub fn position_at(&self, now_ms: u64) -> f64 {
        if !self.is_playing {
            return self.track_position_seconds;
        }
        let elapsed_ms = now_ms.saturating_sub(self.playback_start_time_ms);
        self.track_position_seconds + elapsed_ms as f64 / 1000.0
    }

    pub fn room_info(&self, now_ms: u64) -> RoomInfo {
        RoomInfo {
            current_track: self.current_track.clone(),
            is_playing: self.is_playing,
            track_position: self.position_at(now_ms),
            clients: self.client_list(),
            listening_source: self.listening_source,
            spatial_active: self.spatial_active,
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id.clone(),
            client_count: self.members.len(),
            is_playing: self.is_playing,
            current_track: self.current_track.clone(),
            created_at: self.created_at_ms,
            has_audio: !self.audio_sources.is_empty(),
        }
    }
}

/// Client-side view of the room we are in
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub room_id: String,
    /// Our server-assigned id
    pub client_id: String,
    pub clients: Vec<ClientInfo>,
    pub current_track: Option<String>,
    pub listening_source: Position,
    pub spatial_active: bool,
}

impl RoomView {
    pub fn from_snapshot(client_id: String, room_id: String, info: &RoomInfo) -> Self {
        Self {
            room_id,
            client_id,
            clients: info.clients.clone(),
            current_track: info.current_track.clone(),
            listening_source: info.listening_source,
            spatial_active: info.spatial_active,
        }
    }

    /// Our own roster entry
    pub fn me(&self) -> Option<&ClientInfo> {
        self.clients.iter().find(|c| c.client_id == self.client_id)
    }
}

/// Represents the room we're in (or not)
#[derive(Debug, Default)]
pub enum Room {
    /// Not in any room
    #[default]
    None,
    /// Connecting, waiting for the server snapshot
    Joining { room_id: String, username: String },
    /// In an active room
    Active(RoomView),
}

impl Room {
    /// Check if we're in an active room
    pub fn is_active(&self) -> bool {
        matches!(self, Room::Active(_))
    }

    /// Check if we're joining or in a room
    pub fn is_busy(&self) -> bool {
        !matches!(self, Room::None)
    }

    pub fn view(&self) -> Option<&RoomView> {
        match self {
            Room::Active(view) => Some(view),
            _ => None,
        }
    }

    pub fn view_mut(&mut self) -> Option<&mut RoomView> {
        match self {
            Room::Active(view) => Some(view),
            _ => None,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Room::None => None,
            Room::Joining { room_id, .. } => Some(room_id),
            Room::Active(view) => Some(&view.room_id),
        }
    }
}
