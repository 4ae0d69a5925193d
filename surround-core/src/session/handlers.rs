//! Connection, server message and executor event handlers

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::network::ConnectionEvent;
use crate::playback::{ExecutorEvent, PlaybackError};
use crate::sync::{ClientMessage, Room, RoomView, ScheduledAction, ServerMessage};

use super::session::SessionContext;

/// Handle a connection event. Returns false once the connection is gone for
/// good.
pub(crate) async fn handle_connection_event(ctx: &Arc<SessionContext>, event: ConnectionEvent) -> bool {
    match event {
        ConnectionEvent::Connected => {
            info!("Connected, starting clock sync");
            ctx.clock.write().force_resync(ctx.local_clock.now_ms());
            ctx.start_probing();
        }

        ConnectionEvent::Message {
            message,
            received_at,
        } => {
            handle_server_message(ctx, received_at, message).await;
        }

        ConnectionEvent::Disconnected { will_retry } => {
            ctx.stop_probing();
            ctx.notify(|cb| cb.on_disconnected(will_retry));
            if !will_retry {
                info!("Room connection closed by server");
                ctx.clear_room_state();
                *ctx.connection.write() = None;
                *ctx.room.write() = Room::None;
                return false;
            }
            // Keep the room id around so the fresh snapshot slots back in
            let mut room = ctx.room.write();
            let rejoining = room.view().map(|view| Room::Joining {
                room_id: view.room_id.clone(),
                username: view.me().map(|c| c.username.clone()).unwrap_or_default(),
            });
            if let Some(rejoining) = rejoining {
                *room = rejoining;
            }
        }

        ConnectionEvent::Error(e) => {
            warn!("Connection error: {}", e);
            ctx.notify(|cb| cb.on_error(e));
        }
    }
    true
}

/// Handle one server frame read off the socket at local time `received_at`
pub(crate) async fn handle_server_message(
    ctx: &Arc<SessionContext>,
    received_at: u64,
    message: ServerMessage,
) {
    debug!("Received {}", message.kind());

    match message {
        ServerMessage::ConnectionEstablished {
            client_id,
            room_id,
            room_info,
        } => {
            info!("Joined room {} as {}", room_id, client_id);

            // The snapshot replaces whatever we had, including armed actions
            ctx.executor.reset();
            ctx.executor.clear_library();
            ctx.queue.write().clear();
            ctx.executor.set_client_id(Some(client_id.clone()));

            let view = RoomView::from_snapshot(client_id, room_id, &room_info);
            *ctx.room.write() = Room::Active(view.clone());
            ctx.notify(|cb| cb.on_connected(view));
        }

        ServerMessage::NtpResponse { t0, t1, t2 } => {
            let t3 = received_at;
            let status = {
                let mut engine = ctx.clock.write();
                engine.record_response(t0, t1, t2, t3);
                (!engine.should_probe()).then(|| engine.status(t3))
            };
            if let Some(status) = status {
                info!(
                    "Clock sync round complete: offset={:.1}ms rtt={:.1}ms quality={}",
                    status.offset_ms,
                    status.latency_ms,
                    status.quality.as_str()
                );
                ctx.stop_probing();
                ctx.notify(|cb| cb.on_sync_status(status));
            }
        }

        ServerMessage::ScheduledAction {
            scheduled_action,
            server_time_to_execute,
        } => {
            match &scheduled_action {
                ScheduledAction::SpatialConfig {
                    listening_source, ..
                } => {
                    if let Some(view) = ctx.room.write().view_mut() {
                        view.listening_source = *listening_source;
                        view.spatial_active = true;
                    }
                }
                ScheduledAction::SpatialConfigStop => {
                    if let Some(view) = ctx.room.write().view_mut() {
                        view.spatial_active = false;
                    }
                }
                ScheduledAction::Play { audio_id, .. } => {
                    ctx.queue.write().select(audio_id);
                }
                ScheduledAction::Pause => {}
            }

            if let Err(e) = ctx
                .executor
                .on_scheduled_action(scheduled_action, server_time_to_execute)
            {
                warn!("Scheduled action not executed: {}", e);
                ctx.notify(|cb| cb.on_error(e.to_string()));
            }
        }

        ServerMessage::ClientUpdate { clients } => {
            debug!("Roster now has {} members", clients.len());
            if let Some(view) = ctx.room.write().view_mut() {
                view.clients = clients.clone();
            }
            ctx.notify(|cb| cb.on_clients_changed(clients));
        }

        ServerMessage::TrackChange {
            audio_id,
            client_id,
            ..
        } => {
            info!("Track changed to {} by {}", audio_id, client_id);
            ctx.queue.write().select(&audio_id);
            if let Some(view) = ctx.room.write().view_mut() {
                view.current_track = Some(audio_id.clone());
            }
            ctx.notify(|cb| cb.on_track_changed(audio_id, Some(client_id)));
        }

        ServerMessage::NewAudioSource {
            audio_id,
            audio_name,
            audio_buffer,
            uploaded_by,
        } => {
            let decoder = ctx.decoder.clone();
            let name = audio_name.clone();
            let decoded = tokio::task::spawn_blocking(move || decoder.decode(&name, &audio_buffer))
                .await
                .unwrap_or_else(|e| {
                    Err(PlaybackError::Decode {
                        name: audio_name.clone(),
                        reason: e.to_string(),
                    })
                });

            match decoded {
                Ok(audio) => {
                    info!(
                        "Loaded {} ({:.1}s) from {}",
                        audio_name,
                        audio.duration_secs(),
                        uploaded_by.as_deref().unwrap_or("room")
                    );
                    ctx.executor.insert_buffer(audio_id.clone(), Arc::new(audio));
                    let current = ctx.room.read().view().and_then(|v| v.current_track.clone());
                    {
                        let mut queue = ctx.queue.write();
                        queue.add(&audio_id, &audio_name);
                        if current.as_deref() == Some(audio_id.as_str()) {
                            queue.select(&audio_id);
                        }
                    }
                    ctx.notify(|cb| cb.on_audio_source_added(audio_id, audio_name));
                }
                Err(e) => {
                    // Non-fatal: the room goes on without this source
                    warn!("Failed to load shared audio: {}", e);
                    ctx.notify(|cb| cb.on_error(e.to_string()));
                }
            }
        }
    }
}

/// Handle an executor event
pub(crate) fn handle_executor_event(ctx: &Arc<SessionContext>, event: ExecutorEvent) {
    match event {
        ExecutorEvent::Fired { kind } => {
            debug!("{} executed", kind);
            let phase = ctx.executor.phase();
            let audio_id = ctx.executor.current_audio();
            ctx.notify(|cb| cb.on_playback_changed(phase, audio_id));
        }

        ExecutorEvent::TrackEnded { audio_id } => {
            let phase = ctx.executor.phase();
            ctx.notify(|cb| cb.on_playback_changed(phase, Some(audio_id.clone())));

            let next = ctx.queue.write().next().map(str::to_string);
            match next {
                Some(next) => {
                    info!("{} ended, advancing to {}", audio_id, next);
                    let play = ClientMessage::Play {
                        audio_id: next,
                        track_time_seconds: 0.0,
                    };
                    if let Err(e) = ctx.send(play) {
                        warn!("Failed to request next track: {}", e);
                    }
                }
                None => debug!("{} ended, nothing queued after it", audio_id),
            }
        }

        ExecutorEvent::Error(message) => {
            warn!("Playback error: {}", message);
            ctx.notify(|cb| cb.on_error(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SyncStatus;
    use crate::network::{ConnectionCommand, ConnectionHandle};
    use crate::playback::{AudioDecoder, DecodedAudio, PlaybackPhase, VirtualOutput};
    use crate::session::{SessionCallback, SessionConfig};
    use crate::sync::{ClientInfo, Position, RoomInfo};
    use crate::time::ManualClock;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Decodes any payload whose first byte is non-zero into that many
    /// seconds of silence
    struct ByteLengthDecoder;

    impl AudioDecoder for ByteLengthDecoder {
        fn decode(&self, name: &str, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
            match bytes.first() {
                Some(&secs) if secs > 0 => Ok(DecodedAudio::silence(100, 1, secs as f64)),
                _ => Err(PlaybackError::Decode {
                    name: name.to_string(),
                    reason: "empty".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl SessionCallback for Recorder {
        fn on_connected(&self, room: RoomView) {
            self.log.lock().push(format!("connected {}", room.room_id));
        }
        fn on_clients_changed(&self, clients: Vec<ClientInfo>) {
            self.log.lock().push(format!("clients {}", clients.len()));
        }
        fn on_track_changed(&self, audio_id: String, _changed_by: Option<String>) {
            self.log.lock().push(format!("track {}", audio_id));
        }
        fn on_audio_source_added(&self, audio_id: String, _name: String) {
            self.log.lock().push(format!("source {}", audio_id));
        }
        fn on_playback_changed(&self, phase: PlaybackPhase, _audio_id: Option<String>) {
            self.log.lock().push(format!("playback {:?}", phase));
        }
        fn on_sync_status(&self, _status: SyncStatus) {
            self.log.lock().push("synced".to_string());
        }
        fn on_error(&self, message: String) {
            self.log.lock().push(format!("error {}", message));
        }
        fn on_disconnected(&self, will_retry: bool) {
            self.log.lock().push(format!("disconnected {}", will_retry));
        }
    }

    const NOW: u64 = 1_000_000;

    struct Harness {
        ctx: Arc<SessionContext>,
        recorder: Arc<Recorder>,
        local: Arc<ManualClock>,
        sent: mpsc::UnboundedReceiver<ConnectionCommand>,
        executor_rx: mpsc::UnboundedReceiver<ExecutorEvent>,
    }

    fn harness() -> Harness {
        let local = Arc::new(ManualClock::new(NOW));
        let (ctx, executor_rx) = SessionContext::new(
            SessionConfig::default(),
            Arc::new(VirtualOutput::new()),
            Arc::new(ByteLengthDecoder),
            local.clone(),
        );
        let (command_tx, sent) = mpsc::unbounded_channel();
        *ctx.connection.write() = Some(ConnectionHandle::from_sender(command_tx));
        let recorder = Arc::new(Recorder::default());
        let callback: Arc<dyn SessionCallback> = recorder.clone();
        *ctx.callback.write() = Some(callback);
        Harness {
            ctx: Arc::new(ctx),
            recorder,
            local,
            sent,
            executor_rx,
        }
    }

    fn snapshot(client_id: &str, current_track: Option<&str>) -> ServerMessage {
        ServerMessage::ConnectionEstablished {
            client_id: client_id.into(),
            room_id: "ABC123".into(),
            room_info: RoomInfo {
                current_track: current_track.map(str::to_string),
                is_playing: false,
                track_position: 0.0,
                clients: vec![ClientInfo {
                    client_id: client_id.into(),
                    username: "ann".into(),
                    position: Position::new(75.0, 50.0),
                    is_active: true,
                    rtt: 0.0,
                }],
                listening_source: Position::CENTER,
                spatial_active: false,
            },
        }
    }

    fn source(audio_id: &str, secs: u8) -> ServerMessage {
        ServerMessage::NewAudioSource {
            audio_id: audio_id.into(),
            audio_name: format!("{}.wav", audio_id),
            audio_buffer: vec![secs],
            uploaded_by: Some("someone".into()),
        }
    }

    fn sent_messages(h: &mut Harness) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(ConnectionCommand::Send(msg)) = h.sent.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_snapshot_replaces_local_state() {
        let h = harness();
        handle_server_message(&h.ctx, NOW, snapshot("c1", Some("b"))).await;
        handle_server_message(&h.ctx, NOW, source("a", 5)).await;
        handle_server_message(&h.ctx, NOW, source("b", 5)).await;

        assert!(h.ctx.executor.has_buffer("a"));
        // The room's current track wins over first-added selection
        assert_eq!(h.ctx.queue.read().selected(), Some("b"));

        // Reconnect: a fresh snapshot with no sources wipes the library
        handle_server_message(&h.ctx, NOW, snapshot("c2", None)).await;
        assert!(!h.ctx.executor.has_buffer("a"));
        assert!(h.ctx.queue.read().is_empty());
        assert_eq!(h.ctx.room.read().view().unwrap().client_id, "c2");

        let log = h.recorder.log.lock().clone();
        assert_eq!(
            log,
            vec!["connected ABC123", "source a", "source b", "connected ABC123"]
        );
    }

    #[tokio::test]
    async fn test_decode_failure_is_a_notice() {
        let h = harness();
        handle_server_message(&h.ctx, NOW, snapshot("c1", None)).await;
        handle_server_message(&h.ctx, NOW, source("broken", 0)).await;

        assert!(!h.ctx.executor.has_buffer("broken"));
        assert!(h.ctx.room.read().is_active());
        let log = h.recorder.log.lock().clone();
        assert!(log.last().unwrap().starts_with("error Failed to decode broken.wav"));
    }

    #[tokio::test]
    async fn test_play_for_missing_source_is_a_notice() {
        let h = harness();
        handle_server_message(&h.ctx, NOW, snapshot("c1", None)).await;
        handle_server_message(
            &h.ctx,
            NOW,
            ServerMessage::ScheduledAction {
                scheduled_action: ScheduledAction::Play {
                    audio_id: "nope".into(),
                    track_time_seconds: 0.0,
                },
                server_time_to_execute: NOW,
            },
        )
        .await;
        assert_eq!(h.ctx.executor.phase(), PlaybackPhase::Stopped);
        let log = h.recorder.log.lock().clone();
        assert_eq!(log.last().unwrap(), "error Audio source not loaded: nope");
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_end_requests_next_track() {
        let mut h = harness();
        handle_server_message(&h.ctx, NOW, snapshot("c1", None)).await;
        handle_server_message(&h.ctx, NOW, source("a", 1)).await;
        handle_server_message(&h.ctx, NOW, source("b", 3)).await;

        // Past target: plays immediately
        handle_server_message(
            &h.ctx,
            NOW,
            ServerMessage::ScheduledAction {
                scheduled_action: ScheduledAction::Play {
                    audio_id: "a".into(),
                    track_time_seconds: 0.0,
                },
                server_time_to_execute: NOW - 1,
            },
        )
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
        while let Ok(event) = h.executor_rx.try_recv() {
            handle_executor_event(&h.ctx, event);
        }

        let sent = sent_messages(&mut h);
        assert_eq!(
            sent,
            vec![ClientMessage::Play {
                audio_id: "b".into(),
                track_time_seconds: 0.0
            }]
        );
        assert_eq!(h.ctx.queue.read().selected(), Some("b"));
    }

    #[tokio::test]
    async fn test_ntp_t3_uses_read_time() {
        let h = harness();
        handle_server_message(&h.ctx, NOW, snapshot("c1", None)).await;

        // Server 500 ms ahead, 20 ms each way. The frame was read at NOW
        // but handled 900 ms later, behind a slow decode.
        h.local.set(NOW + 900);
        let response = ServerMessage::NtpResponse {
            t0: NOW - 40,
            t1: NOW - 20 + 500,
            t2: NOW - 20 + 500,
        };
        handle_server_message(&h.ctx, NOW, response).await;

        let working_set = h.ctx.clock.read().working_set();
        assert_eq!(working_set.len(), 1);
        assert_eq!(working_set[0].t3, NOW);
        assert_eq!(working_set[0].round_trip_ms, 40.0);
        assert_eq!(working_set[0].offset_ms, 500.0);
    }

    #[tokio::test]
    async fn test_server_close_leaves_room() {
        let h = harness();
        handle_server_message(&h.ctx, NOW, snapshot("c1", None)).await;

        assert!(handle_connection_event(&h.ctx, ConnectionEvent::Disconnected { will_retry: true }).await);
        assert!(matches!(&*h.ctx.room.read(), Room::Joining { room_id, .. } if room_id == "ABC123"));

        assert!(!handle_connection_event(&h.ctx, ConnectionEvent::Disconnected { will_retry: false }).await);
        assert!(!h.ctx.room.read().is_busy());
        assert!(h.ctx.connection.read().is_none());
    }
}
