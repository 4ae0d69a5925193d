//! Room coordination
//!
//! One `RoomCoordinator` owns the authoritative state of a room and the
//! outbound channels of its members. Every inbound client action lands here,
//! mutates the state and fans the result out. Scheduled actions carry a
//! single server instant computed once for all recipients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use surround_core::spatial::{compute_gains, RESET_RAMP_SECONDS};
use surround_core::sync::{
    AudioSource, ClientMessage, Member, Position, RoomState, RoomSummary, ScheduledAction,
    ServerMessage,
};
use surround_core::time::LocalClock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Encoded frames queued for one connection
pub type Outbound = mpsc::Sender<Arc<str>>;

/// Frames a connection may have queued before new ones are dropped
pub const OUTBOUND_CAPACITY: usize = 256;

/// Lower and upper bound of the listening plane
const PLANE_MIN: f64 = 0.0;
const PLANE_MAX: f64 = 100.0;

/// What an inbound action did to the room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A scheduled action went out to every member
    Scheduled,
    /// State changed or a plain broadcast went out
    Updated,
    /// Dropped (unknown member, unregistered audio, etc.)
    Ignored,
}

pub struct RoomCoordinator {
    state: RoomState,
    outbound: HashMap<String, Outbound>,
    /// Present while the spatial ticker runs
    spatial_cancel: Option<oneshot::Sender<()>>,
    clock: Arc<dyn LocalClock>,
    schedule_lead_ms: u64,
}

impl RoomCoordinator {
    pub fn new(room_id: String, clock: Arc<dyn LocalClock>, schedule_lead: Duration) -> Self {
        let created_at = clock.now_ms();
        Self {
            state: RoomState::new(room_id, created_at),
            outbound: HashMap::new(),
            spatial_cancel: None,
            clock,
            schedule_lead_ms: schedule_lead.as_millis() as u64,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.state.room_id
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.state.members.len()
    }

    pub fn summary(&self) -> RoomSummary {
        self.state.summary()
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Add a member and bring it up to date.
    ///
    /// The newcomer receives, in order: the room snapshot, every registered
    /// audio source, and a PLAY when the room is playing. The whole room then
    /// gets the new roster.
    pub fn join(&mut self, client_id: String, username: Option<String>, outbound: Outbound) {
        let username = username
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_username(&client_id));

        info!("{} joined room {} as {}", client_id, self.state.room_id, username);
        self.state.add_member(Member::new(client_id.clone(), username));
        self.outbound.insert(client_id.clone(), outbound);

        let now = self.now_ms();
        self.send_to(
            &client_id,
            &ServerMessage::ConnectionEstablished {
                client_id: client_id.clone(),
                room_id: self.state.room_id.clone(),
                room_info: self.state.room_info(now),
            },
        );

        for source in &self.state.audio_sources {
            self.send_to(
                &client_id,
                &ServerMessage::NewAudioSource {
                    audio_id: source.id.clone(),
                    audio_name: source.name.clone(),
                    audio_buffer: source.bytes.clone(),
                    uploaded_by: source.uploaded_by.clone(),
                },
            );
        }

        if let (true, Some(audio_id)) = (self.state.is_playing, self.state.current_track.clone()) {
            let execute_at = now + self.schedule_lead_ms;
            let track_time_seconds = self.state.position_at(execute_at).max(0.0);
            self.send_to(
                &client_id,
                &ServerMessage::ScheduledAction {
                    scheduled_action: ScheduledAction::Play {
                        audio_id,
                        track_time_seconds,
                    },
                    server_time_to_execute: execute_at,
                },
            );
        }

        self.broadcast_roster();
    }

    /// Remove a member. Returns false if it was not in the room.
    pub fn leave(&mut self, client_id: &str) -> bool {
        self.outbound.remove(client_id);
        if self.state.remove_member(client_id).is_none() {
            return false;
        }
        info!("{} left room {}", client_id, self.state.room_id);

        if !self.state.is_empty() {
            self.broadcast_roster();
        }
        true
    }

    /// Stop everything the room runs in the background. Called once when the
    /// room is destroyed.
    pub fn shutdown(&mut self) {
        if let Some(cancel) = self.spatial_cancel.take() {
            let _ = cancel.send(());
            debug!("Spatial ticker for room {} cancelled", self.state.room_id);
        }
        self.state.spatial_active = false;
        self.outbound.clear();
    }

    // ========================================================================
    // Inbound actions
    // ========================================================================

    /// Route an inbound message from `client_id`.
    ///
    /// Clock probes and SPATIAL_AUDIO_START are handled by the caller since
    /// they need the connection and the shared room handle respectively.
    pub fn apply(&mut self, client_id: &str, message: ClientMessage) -> Applied {
        if self.state.member(client_id).is_none() {
            debug!("Dropping {} from non-member {}", message.kind(), client_id);
            return Applied::Ignored;
        }

        match message {
            ClientMessage::Play {
                audio_id,
                track_time_seconds,
            } => self.play(&audio_id, track_time_seconds),
            ClientMessage::Pause => self.pause(),
            ClientMessage::SetTrack {
                audio_id,
                track_info,
            } => self.set_track(client_id, &audio_id, track_info),
            ClientMessage::SetPosition { position } => self.set_position(client_id, position),
            ClientMessage::SpatialAudioStop => self.stop_spatial(),
            ClientMessage::SetListeningSource { x, y } => self.set_listening_source(x, y),
            ClientMessage::UploadAudio {
                audio_id,
                audio_name,
                audio_buffer,
            } => self.register_audio_source(client_id, audio_id, audio_name, audio_buffer),
            ClientMessage::NtpRequest { .. } | ClientMessage::SpatialAudioStart => {
                debug!("{} is not routed through the coordinator", message.kind());
                Applied::Ignored
            }
        }
    }

    /// Start `audio_id` from `track_time_seconds` on every device at
    /// now + schedule lead.
    pub fn play(&mut self, audio_id: &str, track_time_seconds: f64) -> Applied {
        if !self.state.has_audio_source(audio_id) {
            debug!("PLAY for unknown audio {} in room {}", audio_id, self.state.room_id);
            return Applied::Ignored;
        }

        let execute_at = self.now_ms() + self.schedule_lead_ms;
        let track_time_seconds = track_time_seconds.max(0.0);

        self.state.is_playing = true;
        self.state.current_track = Some(audio_id.to_string());
        self.state.playback_start_time_ms = execute_at;
        self.state.track_position_seconds = track_time_seconds;

        info!(
            "Room {}: PLAY {} from {:.2}s at {}",
            self.state.room_id, audio_id, track_time_seconds, execute_at
        );
        self.broadcast_scheduled(
            ScheduledAction::Play {
                audio_id: audio_id.to_string(),
                track_time_seconds,
            },
            execute_at,
        );
        Applied::Scheduled
    }

    /// Stop every device at now + schedule lead
    pub fn pause(&mut self) -> Applied {
        let execute_at = self.now_ms() + self.schedule_lead_ms;

        if self.state.is_playing {
            self.state.track_position_seconds = self.state.position_at(execute_at);
            self.state.playback_start_time_ms = execute_at;
            self.state.is_playing = false;
        }

        info!("Room {}: PAUSE at {}", self.state.room_id, execute_at);
        self.broadcast_scheduled(ScheduledAction::Pause, execute_at);
        Applied::Scheduled
    }

    /// Announce a track selection. Not scheduled.
    pub fn set_track(
        &mut self,
        client_id: &str,
        audio_id: &str,
        track_info: serde_json::Value,
    ) -> Applied {
        if !self.state.has_audio_source(audio_id) {
            debug!("SET_TRACK for unknown audio {} in room {}", audio_id, self.state.room_id);
            return Applied::Ignored;
        }

        self.state.current_track = Some(audio_id.to_string());
        self.broadcast(
            &ServerMessage::TrackChange {
                audio_id: audio_id.to_string(),
                track_info,
                client_id: client_id.to_string(),
            },
            None,
        );
        Applied::Updated
    }

    /// Override the sender's position until the next roster change
    pub fn set_position(&mut self, client_id: &str, position: Position) -> Applied {
        let Some(member) = self.state.member_mut(client_id) else {
            return Applied::Ignored;
        };
        member.position = clamp_to_plane(position);
        self.broadcast_roster();
        Applied::Updated
    }

    /// Move the listening source. Picked up by the next spatial tick.
    pub fn set_listening_source(&mut self, x: f64, y: f64) -> Applied {
        self.state.listening_source = clamp_to_plane(Position::new(x, y));
        Applied::Updated
    }

    /// Store an uploaded source and hand it to everyone but the uploader.
    /// Re-uploading an id replaces the stored bytes.
    pub fn register_audio_source(
        &mut self,
        client_id: &str,
        audio_id: String,
        audio_name: String,
        audio_buffer: Vec<u8>,
    ) -> Applied {
        info!(
            "Room {}: {} uploaded {} ({} bytes)",
            self.state.room_id,
            client_id,
            audio_name,
            audio_buffer.len()
        );

        let message = ServerMessage::NewAudioSource {
            audio_id: audio_id.clone(),
            audio_name: audio_name.clone(),
            audio_buffer: audio_buffer.clone(),
            uploaded_by: Some(client_id.to_string()),
        };

        let uploaded_at_ms = self.now_ms();
        self.state.register_audio_source(AudioSource {
            id: audio_id,
            name: audio_name,
            bytes: audio_buffer,
            uploaded_by: Some(client_id.to_string()),
            uploaded_at_ms,
        });

        self.broadcast(&message, Some(client_id));
        Applied::Updated
    }

    /// Store the round trip the server measured for a member
    pub fn record_round_trip(&mut self, client_id: &str, rtt_ms: f64) {
        if let Some(member) = self.state.member_mut(client_id) {
            member.rtt_ms = rtt_ms;
        }
    }

    // ========================================================================
    // Spatial audio
    // ========================================================================

    pub fn spatial_running(&self) -> bool {
        self.spatial_cancel.is_some()
    }

    /// Hand over the cancel end of a freshly spawned ticker
    pub fn set_spatial_cancel(&mut self, cancel: oneshot::Sender<()>) {
        self.spatial_cancel = Some(cancel);
        self.state.spatial_active = true;
    }

    /// Cancel the ticker (if any) and ramp every device back to unity now
    pub fn stop_spatial(&mut self) -> Applied {
        if let Some(cancel) = self.spatial_cancel.take() {
            let _ = cancel.send(());
        }
        self.state.spatial_active = false;

        info!(
            "Room {}: spatial audio stopped, ramping to unity over {}s",
            self.state.room_id, RESET_RAMP_SECONDS
        );
        let now = self.now_ms();
        self.broadcast_scheduled(ScheduledAction::SpatialConfigStop, now);
        Applied::Scheduled
    }

    /// One spatial tick: gains from each member's distance to the listening
    /// source, executed `lead` from now.
    pub fn broadcast_spatial_gains(&self, lead: Duration) {
        if self.state.is_empty() {
            return;
        }
        let gains = compute_gains(&self.state.listening_source, &self.state.members);
        let execute_at = self.now_ms() + lead.as_millis() as u64;
        self.broadcast_scheduled(
            ScheduledAction::SpatialConfig {
                listening_source: self.state.listening_source,
                gains,
            },
            execute_at,
        );
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    fn broadcast_roster(&self) {
        self.broadcast(
            &ServerMessage::ClientUpdate {
                clients: self.state.client_list(),
            },
            None,
        );
    }

    fn broadcast_scheduled(&self, action: ScheduledAction, server_time_to_execute: u64) {
        self.broadcast(
            &ServerMessage::ScheduledAction {
                scheduled_action: action,
                server_time_to_execute,
            },
            None,
        );
    }

    /// Send one encoded copy of `message` to every member except `exclude`
    fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) {
        let Some(frame) = encode(message) else {
            return;
        };
        for (client_id, outbound) in &self.outbound {
            if Some(client_id.as_str()) == exclude {
                continue;
            }
            deliver(client_id, outbound, Arc::clone(&frame));
        }
    }

    fn send_to(&self, client_id: &str, message: &ServerMessage) {
        let (Some(outbound), Some(frame)) = (self.outbound.get(client_id), encode(message)) else {
            return;
        };
        deliver(client_id, outbound, frame);
    }
}

/// Queue without waiting. A member that stops reading loses frames instead
/// of growing its queue.
pub fn deliver(client_id: &str, outbound: &Outbound, frame: Arc<str>) {
    match outbound.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => debug!("Outbound queue of {} is full, dropping frame", client_id),
        // The connection is on its way out
        Err(TrySendError::Closed(_)) => {}
    }
}

fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match message.to_json() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            warn!("Failed to encode {}: {}", message.kind(), e);
            None
        }
    }
}

fn clamp_to_plane(position: Position) -> Position {
    Position::new(
        position.x.clamp(PLANE_MIN, PLANE_MAX),
        position.y.clamp(PLANE_MIN, PLANE_MAX),
    )
}

/// `User_` plus the head of the client id
fn default_username(client_id: &str) -> String {
    let head: String = client_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(4).collect();
    format!("User_{}", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use surround_core::clock::new_shared_clock;
    use surround_core::playback::{DecodedAudio, OutputCall, ScheduledExecutor, VirtualOutput};
    use surround_core::time::ManualClock;

    const T0: u64 = 1_700_000_000_000;
    const LEAD: Duration = Duration::from_millis(750);

    struct Client {
        id: String,
        rx: mpsc::Receiver<Arc<str>>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                messages.push(ServerMessage::parse(&frame).unwrap());
            }
            messages
        }
    }

    fn room() -> (RoomCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let coordinator = RoomCoordinator::new("ABC123".into(), clock.clone(), LEAD);
        (coordinator, clock)
    }

    fn join(room: &mut RoomCoordinator, id: &str, name: &str) -> Client {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        room.join(id.to_string(), Some(name.to_string()), tx);
        Client { id: id.to_string(), rx }
    }

    fn kinds(messages: &[ServerMessage]) -> Vec<&'static str> {
        messages.iter().map(ServerMessage::kind).collect()
    }

    #[test]
    fn test_join_sends_snapshot_then_roster() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");

        let messages = a.drain();
        assert_eq!(kinds(&messages), vec!["CONNECTION_ESTABLISHED", "CLIENT_UPDATE"]);
        match &messages[0] {
            ServerMessage::ConnectionEstablished {
                client_id,
                room_id,
                room_info,
            } => {
                assert_eq!(client_id, "a");
                assert_eq!(room_id, "ABC123");
                assert_eq!(room_info.clients.len(), 1);
                assert!(!room_info.is_playing);
                assert_eq!(room_info.listening_source, Position::CENTER);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_late_joiner_gets_sources_and_play() {
        let (mut room, clock) = room();
        let mut a = join(&mut room, "a", "Ann");
        room.register_audio_source("a", "song".into(), "Song".into(), vec![1, 2, 3]);
        assert_eq!(room.play("song", 10.0), Applied::Scheduled);
        a.drain();

        // Join 2s after playback started
        clock.advance(750 + 2_000);
        let mut b = join(&mut room, "b", "Bob");

        let messages = b.drain();
        assert_eq!(
            kinds(&messages),
            vec!["CONNECTION_ESTABLISHED", "NEW_AUDIO_SOURCE", "SCHEDULED_ACTION", "CLIENT_UPDATE"]
        );
        match &messages[1] {
            ServerMessage::NewAudioSource {
                audio_id,
                audio_buffer,
                uploaded_by,
                ..
            } => {
                assert_eq!(audio_id, "song");
                assert_eq!(audio_buffer, &vec![1, 2, 3]);
                assert_eq!(uploaded_by.as_deref(), Some("a"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &messages[2] {
            ServerMessage::ScheduledAction {
                scheduled_action:
                    ScheduledAction::Play {
                        audio_id,
                        track_time_seconds,
                    },
                server_time_to_execute,
            } => {
                assert_eq!(audio_id, "song");
                let now = clock.now_ms();
                assert_eq!(*server_time_to_execute, now + 750);
                // Position at the execution instant, not at the join
                assert!((track_time_seconds - 12.75).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Existing members only see the roster change
        assert_eq!(kinds(&a.drain()), vec!["CLIENT_UPDATE"]);
    }

    #[test]
    fn test_play_and_pause_share_one_instant() {
        let (mut room, clock) = room();
        let mut a = join(&mut room, "a", "Ann");
        let mut b = join(&mut room, "b", "Bob");
        room.register_audio_source("a", "song".into(), "Song".into(), vec![0]);
        a.drain();
        b.drain();

        room.play("song", 0.0);
        let expected = T0 + 750;
        for client in [&mut a, &mut b] {
            match client.drain().as_slice() {
                [ServerMessage::ScheduledAction {
                    scheduled_action: ScheduledAction::Play { .. },
                    server_time_to_execute,
                }] => assert_eq!(*server_time_to_execute, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(room.state().is_playing);
        assert_eq!(room.state().playback_start_time_ms, expected);

        clock.advance(5_000);
        room.pause();
        for client in [&mut a, &mut b] {
            match client.drain().as_slice() {
                [ServerMessage::ScheduledAction {
                    scheduled_action: ScheduledAction::Pause,
                    server_time_to_execute,
                }] => assert_eq!(*server_time_to_execute, T0 + 5_750),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(!room.state().is_playing);
        assert!((room.state().track_position_seconds - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_audio_is_dropped() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        a.drain();

        assert_eq!(room.play("missing", 0.0), Applied::Ignored);
        assert_eq!(
            room.set_track("a", "missing", serde_json::Value::Null),
            Applied::Ignored
        );
        assert!(a.drain().is_empty());
        assert!(!room.state().is_playing);
        assert!(room.state().current_track.is_none());
    }

    #[test]
    fn test_non_member_actions_are_dropped() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        a.drain();

        assert_eq!(room.apply("ghost", ClientMessage::Pause), Applied::Ignored);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_upload_skips_uploader() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        let mut b = join(&mut room, "b", "Bob");
        a.drain();
        b.drain();

        room.apply(
            "a",
            ClientMessage::UploadAudio {
                audio_id: "song".into(),
                audio_name: "Song".into(),
                audio_buffer: vec![9; 16],
            },
        );
        assert!(a.drain().is_empty());
        assert_eq!(kinds(&b.drain()), vec!["NEW_AUDIO_SOURCE"]);
        assert!(room.state().has_audio_source("song"));
    }

    #[test]
    fn test_set_track_broadcasts_to_everyone() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        room.register_audio_source("a", "song".into(), "Song".into(), vec![0]);
        a.drain();

        room.set_track("a", "song", serde_json::json!({ "title": "Song" }));
        match a.drain().as_slice() {
            [ServerMessage::TrackChange {
                audio_id, client_id, ..
            }] => {
                assert_eq!(audio_id, "song");
                assert_eq!(client_id, "a");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(room.state().current_track.as_deref(), Some("song"));
    }

    #[test]
    fn test_position_override_until_roster_change() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        a.drain();

        room.set_position("a", Position::new(10.0, 120.0));
        let me = room.state().member("a").unwrap();
        assert_eq!(me.position, Position::new(10.0, 100.0));
        assert_eq!(kinds(&a.drain()), vec!["CLIENT_UPDATE"]);

        // The next join relayouts everyone on the circle
        let _b = join(&mut room, "b", "Bob");
        assert_eq!(room.state().member("a").unwrap().position, Position::new(75.0, 50.0));
    }

    #[test]
    fn test_leave_broadcasts_roster() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        let b = join(&mut room, "b", "Bob");
        a.drain();

        assert!(room.leave(&b.id));
        assert!(!room.leave(&b.id));
        match a.drain().as_slice() {
            [ServerMessage::ClientUpdate { clients }] => {
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0].position, Position::new(75.0, 50.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stalled_member_queue_is_bounded() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        let mut stalled = join(&mut room, "s", "Sam");
        a.drain();

        for _ in 0..OUTBOUND_CAPACITY * 4 {
            room.broadcast_spatial_gains(Duration::from_millis(100));
            assert_eq!(kinds(&a.drain()), vec!["SCHEDULED_ACTION"]);
        }

        // Snapshot and roster plus as many ticks as fit
        let queued = stalled.drain();
        assert_eq!(queued.len(), OUTBOUND_CAPACITY);
        assert_eq!(kinds(&queued[..2]), vec!["CONNECTION_ESTABLISHED", "CLIENT_UPDATE"]);

        room.broadcast_spatial_gains(Duration::from_millis(100));
        assert_eq!(kinds(&stalled.drain()), vec!["SCHEDULED_ACTION"]);
        assert_eq!(kinds(&a.drain()), vec!["SCHEDULED_ACTION"]);
    }

    #[test]
    fn test_default_username() {
        let (mut room, _) = room();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        room.join("5f0c9e2a-1111".into(), Some("  ".into()), tx);
        assert_eq!(room.state().members[0].username, "User_5f0c");
    }

    #[test]
    fn test_spatial_gains_follow_distance() {
        let (mut room, clock) = room();
        let mut a = join(&mut room, "a", "Ann");
        let mut b = join(&mut room, "b", "Bob");
        a.drain();
        b.drain();

        // a sits at (75,50), b at (25,50)
        room.set_listening_source(75.0, 50.0);
        room.broadcast_spatial_gains(Duration::from_millis(100));

        match a.drain().as_slice() {
            [ServerMessage::ScheduledAction {
                scheduled_action:
                    ScheduledAction::SpatialConfig {
                        listening_source,
                        gains,
                    },
                server_time_to_execute,
            }] => {
                assert_eq!(*server_time_to_execute, clock.now_ms() + 100);
                assert_eq!(*listening_source, Position::new(75.0, 50.0));
                assert!((gains["a"].gain - 1.0).abs() < 1e-9);
                assert!((gains["b"].gain - 0.5).abs() < 1e-9);
                assert!((gains["a"].ramp_time - 0.25).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_stop_spatial_cancels_and_resets_now() {
        let (mut room, clock) = room();
        let mut a = join(&mut room, "a", "Ann");
        a.drain();

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        room.set_spatial_cancel(cancel_tx);
        assert!(room.spatial_running());
        assert!(room.state().spatial_active);

        room.stop_spatial();
        assert!(!room.spatial_running());
        assert!(cancel_rx.try_recv().is_ok());
        match a.drain().as_slice() {
            [ServerMessage::ScheduledAction {
                scheduled_action: ScheduledAction::SpatialConfigStop,
                server_time_to_execute,
            }] => assert_eq!(*server_time_to_execute, clock.now_ms()),
            other => panic!("unexpected {:?}", other),
        }
    }

    struct Device {
        executor: ScheduledExecutor,
        output: Arc<VirtualOutput>,
    }

    /// A synced device whose clock runs `ahead_ms` ahead of the server
    fn device(ahead_ms: u64) -> Device {
        let local_now = T0 + ahead_ms;
        let clock = new_shared_clock();
        {
            let mut engine = clock.write();
            for i in 0..8u64 {
                let t0 = local_now - 1_000 + i * 30;
                let t1 = t0 - ahead_ms + 12;
                engine.record_response(t0, t1, t1 + 1, t0 + 25);
            }
        }
        let output = Arc::new(VirtualOutput::new());
        let (executor, _events) =
            ScheduledExecutor::new(output.clone(), clock, Arc::new(ManualClock::new(local_now)));
        executor.insert_buffer("song".into(), Arc::new(DecodedAudio::silence(100, 1, 60.0)));
        Device { executor, output }
    }

    /// Room ABC123: A presses play at 10 s with a 750 ms lead. B's clock runs
    /// 200 ms ahead of the server. Both start 10 s into the track at the
    /// scheduled instant.
    #[tokio::test(start_paused = true)]
    async fn test_abc123_members_start_together() {
        let (mut room, _) = room();
        let mut a = join(&mut room, "a", "Ann");
        let mut b = join(&mut room, "b", "Bob");
        room.register_audio_source("a", "song".into(), "Song".into(), vec![0]);
        a.drain();
        b.drain();

        let devices = [device(0), device(200)];
        room.apply(
            "a",
            ClientMessage::Play {
                audio_id: "song".into(),
                track_time_seconds: 10.0,
            },
        );

        for (client, d) in [&mut a, &mut b].into_iter().zip(&devices) {
            match client.drain().as_slice() {
                [ServerMessage::ScheduledAction {
                    scheduled_action,
                    server_time_to_execute,
                }] => {
                    assert_eq!(*server_time_to_execute, T0 + 750);
                    assert_eq!(
                        *scheduled_action,
                        ScheduledAction::Play {
                            audio_id: "song".into(),
                            track_time_seconds: 10.0,
                        }
                    );
                    d.executor
                        .on_scheduled_action(scheduled_action.clone(), *server_time_to_execute)
                        .unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        tokio::time::sleep(Duration::from_millis(800)).await;

        // Both outputs were created at the same instant, so their audio
        // clocks line up with server time T0
        let started: Vec<(f64, f64)> = devices
            .iter()
            .map(|d| match d.output.calls().as_slice() {
                [OutputCall::Start { at, offset, .. }] => (*at, *offset),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        for (at, offset) in &started {
            assert!((at - 0.75).abs() < 0.020, "started at {}", at);
            assert_eq!(*offset, 10.0);
        }
        assert!((started[0].0 - started[1].0).abs() < 0.020);
    }
}
