//! Client session
//!
//! Owns the room connection, the clock sync probe loop and the scheduled
//! executor, and exposes the user-facing room and transport operations.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock, SyncStatus};
use crate::network::{ConnectionHandle, ConnectionManager, RoomDirectory, RoomId};
use crate::playback::{
    AudioDecoder, AudioOutput, ExecutorEvent, PlaybackError, PlaybackPhase, QueueEntry,
    ScheduledExecutor, TrackQueue,
};
use crate::sync::{ClientMessage, Position, Room, RoomView};
use crate::time::{LocalClock, SystemClock};

use super::handlers::{handle_connection_event, handle_executor_event};
use super::types::{SessionCallback, SessionConfig, SessionError};

/// State shared between the session and its background tasks
pub(crate) struct SessionContext {
    pub(crate) config: SessionConfig,
    pub(crate) room: RwLock<Room>,
    pub(crate) callback: RwLock<Option<Arc<dyn SessionCallback>>>,
    pub(crate) connection: RwLock<Option<ConnectionHandle>>,
    pub(crate) clock: SharedClock,
    pub(crate) local_clock: Arc<dyn LocalClock>,
    pub(crate) executor: ScheduledExecutor,
    pub(crate) decoder: Arc<dyn AudioDecoder>,
    pub(crate) queue: RwLock<TrackQueue>,
    /// Handle for cancelling the clock probe loop
    pub(crate) probe_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl SessionContext {
    pub(crate) fn new(
        config: SessionConfig,
        output: Arc<dyn AudioOutput>,
        decoder: Arc<dyn AudioDecoder>,
        local_clock: Arc<dyn LocalClock>,
    ) -> (Self, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let clock = clock::new_shared_clock_with_ceiling(config.probe_ceiling);
        let (executor, executor_rx) = ScheduledExecutor::new(output, clock.clone(), local_clock.clone());
        let context = Self {
            config,
            room: RwLock::new(Room::None),
            callback: RwLock::new(None),
            connection: RwLock::new(None),
            clock,
            local_clock,
            executor,
            decoder,
            queue: RwLock::new(TrackQueue::new()),
            probe_cancel: Mutex::new(None),
        };
        (context, executor_rx)
    }

    /// Run `f` against the callback, if one is set
    pub(crate) fn notify(&self, f: impl FnOnce(&dyn SessionCallback)) {
        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            f(cb.as_ref());
        }
    }

    pub(crate) fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        let connection = self.connection.read();
        let handle = connection.as_ref().ok_or(SessionError::NotInRoom)?;
        debug!("Sending {}", message.kind());
        Ok(handle.send(message)?)
    }

    /// (Re)start the probe loop. It exits on its own once the round is done.
    pub(crate) fn start_probing(self: &Arc<Self>) {
        self.stop_probing();

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        *self.probe_cancel.lock() = Some(cancel_tx);

        let ctx = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ctx.config.probe_interval);
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("Probe loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                let t0 = {
                    let mut engine = ctx.clock.write();
                    if !engine.should_probe() {
                        break;
                    }
                    engine.create_probe(ctx.local_clock.now_ms())
                };
                if let Err(e) = ctx.send(ClientMessage::NtpRequest { t0 }) {
                    debug!("Probe not sent: {}", e);
                    break;
                }
            }
        });
    }

    pub(crate) fn stop_probing(&self) {
        if let Some(cancel) = self.probe_cancel.lock().take() {
            let _ = cancel.send(());
        }
    }

    /// Forget everything tied to the current room
    pub(crate) fn clear_room_state(&self) {
        self.stop_probing();
        self.executor.reset();
        self.executor.clear_library();
        self.executor.set_client_id(None);
        self.queue.write().clear();
    }
}

/// Main session interface
pub struct Session {
    ctx: Arc<SessionContext>,
    directory: RoomDirectory,
    /// Handle for cancelling the event pump
    pump_cancel: Mutex<Option<oneshot::Sender<()>>>,
    /// Event pump task; yields the executor receiver back when it exits
    pump_task: Mutex<Option<JoinHandle<mpsc::UnboundedReceiver<ExecutorEvent>>>>,
    /// Executor events while no pump is running
    executor_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutorEvent>>>,
}

impl Session {
    /// Create a new session on the system clock
    pub fn new(
        config: SessionConfig,
        output: Arc<dyn AudioOutput>,
        decoder: Arc<dyn AudioDecoder>,
    ) -> Self {
        Self::with_local_clock(config, output, decoder, Arc::new(SystemClock))
    }

    pub fn with_local_clock(
        config: SessionConfig,
        output: Arc<dyn AudioOutput>,
        decoder: Arc<dyn AudioDecoder>,
        local_clock: Arc<dyn LocalClock>,
    ) -> Self {
        info!("Initializing session against {}", config.server_url);
        let directory = RoomDirectory::new(config.server_url.clone());
        let (ctx, executor_rx) = SessionContext::new(config, output, decoder, local_clock);
        Self {
            ctx: Arc::new(ctx),
            directory,
            pump_cancel: Mutex::new(None),
            pump_task: Mutex::new(None),
            executor_rx: Mutex::new(Some(executor_rx)),
        }
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.ctx.callback.write() = Some(Arc::from(callback));
    }

    /// Ask the server for a fresh room and join it
    pub async fn create_room(&self, username: &str) -> Result<RoomId, SessionError> {
        if self.ctx.room.read().is_busy() {
            return Err(SessionError::AlreadyInRoom);
        }
        let room_id = self.directory.create_room().await?;
        self.connect(room_id.clone(), username).await?;
        Ok(room_id)
    }

    /// Join a room by id. An empty username lets the server pick one.
    pub async fn join_room(&self, room_id: &str, username: &str) -> Result<(), SessionError> {
        let room_id =
            RoomId::parse(room_id).ok_or_else(|| SessionError::InvalidRoomId(room_id.to_string()))?;
        if self.ctx.room.read().is_busy() {
            return Err(SessionError::AlreadyInRoom);
        }

        if self.ctx.config.validate_join && !self.directory.room_exists(&room_id).await? {
            warn!("Room {} not found", room_id);
            return Err(SessionError::RoomNotFound(room_id.to_string()));
        }

        self.connect(room_id, username).await
    }

    async fn connect(&self, room_id: RoomId, username: &str) -> Result<(), SessionError> {
        let manager = ConnectionManager::new(
            &self.ctx.config.server_url,
            &room_id,
            username,
            self.ctx.config.reconnect_delay,
        )?
        .with_clock(self.ctx.local_clock.clone());

        // A previous pump may still be winding down
        self.cancel_pump();
        let previous = self.pump_task.lock().take();
        if let Some(task) = previous {
            if let Ok(rx) = task.await {
                *self.executor_rx.lock() = Some(rx);
            }
        }
        let executor_rx = self.executor_rx.lock().take();
        let Some(mut executor_rx) = executor_rx else {
            return Err(SessionError::AlreadyInRoom);
        };

        info!("Joining room {}", room_id);
        *self.ctx.room.write() = Room::Joining {
            room_id: room_id.to_string(),
            username: username.to_string(),
        };

        let (handle, mut connection_rx) = manager.start();
        *self.ctx.connection.write() = Some(handle);

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    event = connection_rx.recv() => match event {
                        Some(event) => {
                            if !handle_connection_event(&ctx, event).await {
                                break;
                            }
                        }
                        None => break,
                    },
                    Some(event) = executor_rx.recv() => handle_executor_event(&ctx, event),
                }
            }
            debug!("Session event pump stopped");
            executor_rx
        });
        *self.pump_cancel.lock() = Some(cancel_tx);
        *self.pump_task.lock() = Some(task);
        Ok(())
    }

    fn cancel_pump(&self) {
        if let Some(cancel) = self.pump_cancel.lock().take() {
            let _ = cancel.send(());
        }
    }

    /// Leave the current room
    pub fn leave_room(&self) -> Result<(), SessionError> {
        if !self.ctx.room.read().is_busy() {
            return Err(SessionError::NotInRoom);
        }
        info!("Leaving room");

        if let Some(handle) = self.ctx.connection.write().take() {
            handle.close();
        }
        self.cancel_pump();
        self.ctx.clear_room_state();
        *self.ctx.room.write() = Room::None;
        Ok(())
    }

    /// Current room, once the server snapshot has arrived
    pub fn room_view(&self) -> Option<RoomView> {
        self.ctx.room.read().view().cloned()
    }

    pub fn is_in_room(&self) -> bool {
        self.ctx.room.read().is_active()
    }

    /// Play the selected track. Without an explicit position this resumes
    /// where the track was paused.
    pub fn play(&self, track_time_seconds: Option<f64>) -> Result<(), SessionError> {
        let audio_id = self
            .ctx
            .queue
            .read()
            .selected()
            .map(str::to_string)
            .ok_or(SessionError::NoTrackSelected)?;
        if !self.ctx.executor.has_buffer(&audio_id) {
            return Err(PlaybackError::SourceNotLoaded(audio_id).into());
        }

        let position = track_time_seconds.unwrap_or_else(|| {
            if self.ctx.executor.current_audio().as_deref() == Some(audio_id.as_str()) {
                self.ctx.executor.paused_position()
            } else {
                0.0
            }
        });
        self.ctx.send(ClientMessage::Play {
            audio_id,
            track_time_seconds: position.max(0.0),
        })
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.ctx.send(ClientMessage::Pause)
    }

    /// Switch tracks for the whole room. Playback restarts from the top if
    /// it was running.
    pub fn select_track(&self, audio_id: &str) -> Result<(), SessionError> {
        let name = {
            let mut queue = self.ctx.queue.write();
            if !queue.select(audio_id) {
                return Err(SessionError::UnknownTrack(audio_id.to_string()));
            }
            queue
                .entries()
                .iter()
                .find(|e| e.audio_id == audio_id)
                .map(|e| e.name.clone())
                .unwrap_or_default()
        };
        self.announce_track(audio_id, &name)
    }

    fn announce_track(&self, audio_id: &str, name: &str) -> Result<(), SessionError> {
        self.ctx.send(ClientMessage::SetTrack {
            audio_id: audio_id.to_string(),
            track_info: serde_json::json!({ "name": name }),
        })?;
        if self.ctx.executor.phase() != PlaybackPhase::Stopped {
            self.ctx.send(ClientMessage::Play {
                audio_id: audio_id.to_string(),
                track_time_seconds: 0.0,
            })?;
        }
        Ok(())
    }

    /// Move to the next track. `Ok(None)` when there is nowhere to go.
    pub fn next_track(&self) -> Result<Option<String>, SessionError> {
        let next = self.ctx.queue.write().next().map(str::to_string);
        self.skip_to(next)
    }

    /// Move to the previous track. Unavailable while shuffled.
    pub fn previous_track(&self) -> Result<Option<String>, SessionError> {
        let previous = self.ctx.queue.write().previous().map(str::to_string);
        self.skip_to(previous)
    }

    fn skip_to(&self, audio_id: Option<String>) -> Result<Option<String>, SessionError> {
        let Some(audio_id) = audio_id else {
            return Ok(None);
        };
        let name = self
            .ctx
            .queue
            .read()
            .entries()
            .iter()
            .find(|e| e.audio_id == audio_id)
            .map(|e| e.name.clone())
            .unwrap_or_default();
        self.announce_track(&audio_id, &name)?;
        Ok(Some(audio_id))
    }

    /// Flip shuffle, returning the new setting
    pub fn toggle_shuffle(&self) -> bool {
        self.ctx.queue.write().toggle_shuffle()
    }

    pub fn queue(&self) -> Vec<QueueEntry> {
        self.ctx.queue.read().entries().to_vec()
    }

    pub fn selected_track(&self) -> Option<String> {
        self.ctx.queue.read().selected().map(str::to_string)
    }

    /// Decode an audio file locally and share it with the room. Returns the
    /// id the room will know it by.
    pub async fn upload_audio(&self, name: &str, bytes: Vec<u8>) -> Result<String, SessionError> {
        if !self.ctx.room.read().is_active() {
            return Err(SessionError::NotInRoom);
        }

        let decoder = self.ctx.decoder.clone();
        let decode_name = name.to_string();
        let decode_bytes = bytes.clone();
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&decode_name, &decode_bytes))
            .await
            .map_err(|e| PlaybackError::Decode {
                name: name.to_string(),
                reason: e.to_string(),
            })??;

        let audio_id = upload_id(self.ctx.local_clock.now_ms());
        info!(
            "Uploading {} as {} ({:.1}s)",
            name,
            audio_id,
            decoded.duration_secs()
        );
        self.ctx.executor.insert_buffer(audio_id.clone(), Arc::new(decoded));
        self.ctx.queue.write().add(&audio_id, name);

        self.ctx.send(ClientMessage::UploadAudio {
            audio_id: audio_id.clone(),
            audio_name: name.to_string(),
            audio_buffer: bytes,
        })?;
        Ok(audio_id)
    }

    /// Override our own position on the plane
    pub fn set_position(&self, x: f64, y: f64) -> Result<(), SessionError> {
        self.ctx.send(ClientMessage::SetPosition {
            position: clamp_to_plane(x, y),
        })
    }

    pub fn start_spatial(&self) -> Result<(), SessionError> {
        self.ctx.send(ClientMessage::SpatialAudioStart)
    }

    pub fn stop_spatial(&self) -> Result<(), SessionError> {
        self.ctx.send(ClientMessage::SpatialAudioStop)
    }

    pub fn set_listening_source(&self, x: f64, y: f64) -> Result<(), SessionError> {
        let source = clamp_to_plane(x, y);
        self.ctx.send(ClientMessage::SetListeningSource {
            x: source.x,
            y: source.y,
        })
    }

    /// Start a new clock sync round if the estimate needs one
    pub fn resync(&self) -> bool {
        let needed = self
            .ctx
            .clock
            .write()
            .force_resync(self.ctx.local_clock.now_ms());
        if needed {
            info!("Resyncing clock");
            self.ctx.start_probing();
        }
        needed
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.ctx.clock.read().status(self.ctx.local_clock.now_ms())
    }

    pub fn playback_phase(&self) -> PlaybackPhase {
        self.ctx.executor.phase()
    }

    pub fn current_position(&self) -> f64 {
        self.ctx.executor.current_position()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_pump();
        self.ctx.stop_probing();
        if let Some(handle) = self.ctx.connection.write().take() {
            handle.close();
        }
    }
}

fn clamp_to_plane(x: f64, y: f64) -> Position {
    Position::new(x.clamp(0.0, 100.0), y.clamp(0.0, 100.0))
}

/// Id for a locally uploaded file: `upload-{ms}-{base36 suffix}`
fn upload_id(now_ms: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n: u64 = rand::thread_rng().gen();
    let mut suffix = Vec::new();
    while n > 0 {
        suffix.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    if suffix.is_empty() {
        suffix.push(b'0');
    }
    suffix.reverse();
    format!("upload-{}-{}", now_ms, String::from_utf8_lossy(&suffix))
}
