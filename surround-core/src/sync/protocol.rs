//! Wire Protocol Messages
//!
//! Every frame is a JSON object tagged by `type` in SCREAMING_SNAKE_CASE with
//! camelCase fields. Timestamps are server-absolute milliseconds since the
//! UNIX epoch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A point on the 0..100 listening plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Centre of the plane, the default listening source
    pub const CENTER: Position = Position { x: 50.0, y: 50.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::CENTER
    }
}

/// Target gain for one client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainEntry {
    pub gain: f64,
    /// Ramp duration in seconds
    pub ramp_time: f64,
}

/// An action every client executes at the same server instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ScheduledAction {
    Play {
        audio_id: String,
        track_time_seconds: f64,
    },
    Pause,
    SpatialConfig {
        listening_source: Position,
        gains: HashMap<String, GainEntry>,
    },
    SpatialConfigStop,
}

impl ScheduledAction {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduledAction::Play { .. } => "PLAY",
            ScheduledAction::Pause => "PAUSE",
            ScheduledAction::SpatialConfig { .. } => "SPATIAL_CONFIG",
            ScheduledAction::SpatialConfigStop => "SPATIAL_CONFIG_STOP",
        }
    }

    /// Whether the action drives the transport (start/stop) rather than gain
    pub fn is_transport(&self) -> bool {
        matches!(self, ScheduledAction::Play { .. } | ScheduledAction::Pause)
    }
}

/// A member as seen in roster updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub client_id: String,
    pub username: String,
    pub position: Position,
    pub is_active: bool,
    /// Last round trip the server observed, in milliseconds
    pub rtt: f64,
}

/// Room snapshot sent to a joining client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub current_track: Option<String>,
    pub is_playing: bool,
    /// Track position in seconds at the time of the snapshot
    pub track_position: f64,
    pub clients: Vec<ClientInfo>,
    pub listening_source: Position,
    pub spatial_active: bool,
}

/// Entry of the room directory listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub client_count: usize,
    pub is_playing: bool,
    pub current_track: Option<String>,
    pub created_at: u64,
    pub has_audio: bool,
}

/// Response to an explicit room creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreated {
    pub room_id: String,
    pub created: bool,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Clock probe carrying the client's send time
    NtpRequest { t0: u64 },
    Play {
        audio_id: String,
        #[serde(default)]
        track_time_seconds: f64,
    },
    Pause,
    SetTrack {
        audio_id: String,
        #[serde(default)]
        track_info: serde_json::Value,
    },
    SetPosition { position: Position },
    SpatialAudioStart,
    SpatialAudioStop,
    SetListeningSource { x: f64, y: f64 },
    UploadAudio {
        audio_id: String,
        audio_name: String,
        #[serde(with = "base64_bytes")]
        audio_buffer: Vec<u8>,
    },
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    ConnectionEstablished {
        client_id: String,
        room_id: String,
        room_info: RoomInfo,
    },
    /// Echoed `t0` plus server receive (`t1`) and send (`t2`) times
    NtpResponse { t0: u64, t1: u64, t2: u64 },
    ScheduledAction {
        scheduled_action: ScheduledAction,
        server_time_to_execute: u64,
    },
    ClientUpdate { clients: Vec<ClientInfo> },
    TrackChange {
        audio_id: String,
        track_info: serde_json::Value,
        client_id: String,
    },
    NewAudioSource {
        audio_id: String,
        audio_name: String,
        #[serde(with = "base64_bytes")]
        audio_buffer: Vec<u8>,
        uploaded_by: Option<String>,
    },
}

/// Audio bytes travel as a standard base64 string. Plain byte arrays are
/// still accepted inbound.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Text(String),
        Raw(Vec<u8>),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Encoded::deserialize(deserializer)? {
            Encoded::Text(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            Encoded::Raw(bytes) => Ok(bytes),
        }
    }
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::NtpRequest { .. } => "NTP_REQUEST",
            ClientMessage::Play { .. } => "PLAY",
            ClientMessage::Pause => "PAUSE",
            ClientMessage::SetTrack { .. } => "SET_TRACK",
            ClientMessage::SetPosition { .. } => "SET_POSITION",
            ClientMessage::SpatialAudioStart => "SPATIAL_AUDIO_START",
            ClientMessage::SpatialAudioStop => "SPATIAL_AUDIO_STOP",
            ClientMessage::SetListeningSource { .. } => "SET_LISTENING_SOURCE",
            ClientMessage::UploadAudio { .. } => "UPLOAD_AUDIO",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "CONNECTION_ESTABLISHED",
            ServerMessage::NtpResponse { .. } => "NTP_RESPONSE",
            ServerMessage::ScheduledAction { .. } => "SCHEDULED_ACTION",
            ServerMessage::ClientUpdate { .. } => "CLIENT_UPDATE",
            ServerMessage::TrackChange { .. } => "TRACK_CHANGE",
            ServerMessage::NewAudioSource { .. } => "NEW_AUDIO_SOURCE",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_shape() {
        let msg = ClientMessage::Play {
            audio_id: "a1".into(),
            track_time_seconds: 12.5,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "PLAY", "audioId": "a1", "trackTimeSeconds": 12.5})
        );

        let pause: serde_json::Value =
            serde_json::from_str(&ClientMessage::Pause.to_json().unwrap()).unwrap();
        assert_eq!(pause, json!({"type": "PAUSE"}));
    }

    #[test]
    fn test_parse_inbound_frames() {
        let msg = ClientMessage::parse(r#"{"type":"NTP_REQUEST","t0":1700000000000}"#).unwrap();
        assert_eq!(msg, ClientMessage::NtpRequest { t0: 1_700_000_000_000 });

        // Missing track time defaults to the start
        let msg = ClientMessage::parse(r#"{"type":"PLAY","audioId":"x"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Play {
                audio_id: "x".into(),
                track_time_seconds: 0.0
            }
        );

        let msg = ClientMessage::parse(r#"{"type":"SET_LISTENING_SOURCE","x":10,"y":90}"#).unwrap();
        assert_eq!(msg, ClientMessage::SetListeningSource { x: 10.0, y: 90.0 });

        assert!(ClientMessage::parse(r#"{"type":"SELF_DESTRUCT"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_scheduled_action_nesting() {
        let mut gains = HashMap::new();
        gains.insert(
            "c1".to_string(),
            GainEntry {
                gain: 0.5,
                ramp_time: 0.25,
            },
        );
        let msg = ServerMessage::ScheduledAction {
            scheduled_action: ScheduledAction::SpatialConfig {
                listening_source: Position::CENTER,
                gains,
            },
            server_time_to_execute: 1_000,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "SCHEDULED_ACTION",
                "scheduledAction": {
                    "type": "SPATIAL_CONFIG",
                    "listeningSource": {"x": 50.0, "y": 50.0},
                    "gains": {"c1": {"gain": 0.5, "rampTime": 0.25}}
                },
                "serverTimeToExecute": 1000
            })
        );
    }

    #[test]
    fn test_audio_bytes_are_base64() {
        let msg = ClientMessage::UploadAudio {
            audio_id: "a1".into(),
            audio_name: "Song".into(),
            audio_buffer: vec![0, 1, 2, 250, 255],
        };
        let text = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["audioBuffer"], json!("AAEC+v8="));
        assert_eq!(ClientMessage::parse(&text).unwrap(), msg);

        // About 4/3 of the raw size, not one JSON number per byte
        let big = ServerMessage::NewAudioSource {
            audio_id: "a2".into(),
            audio_name: "Long".into(),
            audio_buffer: vec![200; 3_000_000],
            uploaded_by: None,
        };
        let text = big.to_json().unwrap();
        assert!(text.len() < 4_100_000, "{} bytes", text.len());

        // Older clients send a number array
        let legacy = ServerMessage::parse(
            r#"{"type":"NEW_AUDIO_SOURCE","audioId":"a3","audioName":"x","audioBuffer":[7,8],"uploadedBy":null}"#,
        )
        .unwrap();
        assert!(matches!(legacy, ServerMessage::NewAudioSource { ref audio_buffer, .. } if audio_buffer == &vec![7, 8]));

        assert!(ClientMessage::parse(
            r#"{"type":"UPLOAD_AUDIO","audioId":"a","audioName":"b","audioBuffer":"@@not base64@@"}"#
        )
        .is_err());
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(50.0, 50.0);
        let b = Position::new(80.0, 90.0);
        assert_eq!(a.distance_to(&b), 50.0);
        assert_eq!(Position::default(), Position::CENTER);
    }
}
