//! Metrics tracking for the room server

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use surround_core::sync::RoomSummary;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Room,
    Schedule,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Room => "ROOM",
            LogLevel::Schedule => "SCHED",
        }
    }
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// HTTP/WebSocket port
    pub port: u16,

    /// Lead applied to PLAY/PAUSE, in milliseconds
    pub schedule_lead_ms: u64,

    /// Current number of open room connections
    pub connected_clients: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    /// Rooms currently alive
    pub active_rooms: usize,

    /// Snapshot of the live rooms, oldest first
    pub rooms: Vec<RoomSummary>,

    /// Rooms destroyed after their last member left
    pub rooms_closed: u64,

    /// PLAY/PAUSE actions scheduled
    pub scheduled_actions: u64,

    /// Clock probes answered
    pub ntp_requests: u64,

    /// Audio sources uploaded
    pub uploads: u64,

    /// Bytes of audio received
    pub bytes_uploaded: u64,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Server status
    pub status: ServerStatus,
}

#[derive(Clone, Copy, PartialEq)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

impl Metrics {
    pub fn new(port: u16, schedule_lead_ms: u64) -> Self {
        Self {
            start_time: Local::now(),
            port,
            schedule_lead_ms,
            connected_clients: 0,
            total_connections: 0,
            peak_connections: 0,
            active_rooms: 0,
            rooms: Vec::new(),
            rooms_closed: 0,
            scheduled_actions: 0,
            ntp_requests: 0,
            uploads: 0,
            bytes_uploaded: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Record a member joining a room
    pub fn connection_established(&mut self, client_id: &str, room_id: &str, username: Option<&str>) {
        self.connected_clients += 1;
        self.total_connections += 1;
        if self.connected_clients > self.peak_connections {
            self.peak_connections = self.connected_clients;
        }

        let short_id = truncate_client_id(client_id);
        self.log(
            LogLevel::Connection,
            format!("Joined {}: {} ({})", room_id, short_id, username.unwrap_or("anonymous")),
        );
    }

    /// Record a member leaving. `room_closed` is set when it was the last one.
    pub fn connection_closed(&mut self, client_id: &str, room_id: &str, room_closed: bool) {
        self.connected_clients = self.connected_clients.saturating_sub(1);

        let short_id = truncate_client_id(client_id);
        self.log(LogLevel::Connection, format!("Left {}: {}", room_id, short_id));

        if room_closed {
            self.rooms_closed += 1;
            self.log(LogLevel::Room, format!("Room {} closed", room_id));
        }
    }

    /// Replace the room snapshot shown on the dashboard
    pub fn set_rooms(&mut self, rooms: Vec<RoomSummary>) {
        self.active_rooms = rooms.len();
        self.rooms = rooms;
    }

    /// Record a PLAY or PAUSE going out to a room
    pub fn action_scheduled(&mut self, room_id: &str, kind: &str) {
        self.scheduled_actions += 1;
        self.log(LogLevel::Schedule, format!("{} in {}", kind, room_id));
    }

    pub fn ntp_answered(&mut self) {
        self.ntp_requests += 1;
    }

    pub fn audio_uploaded(&mut self, room_id: &str, name: &str, bytes: usize) {
        self.uploads += 1;
        self.bytes_uploaded += bytes as u64;
        self.log(LogLevel::Room, format!("Upload in {}: {}", room_id, name));
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Truncate a client id for display (first and last few chars)
pub fn truncate_client_id(client_id: &str) -> String {
    let chars: Vec<char> = client_id.chars().collect();
    if chars.len() > 16 {
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        client_id.to_string()
    }
}
