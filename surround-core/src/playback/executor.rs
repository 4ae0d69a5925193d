//! Scheduled action executor
//!
//! Converts a server-absolute execution instant into a local wait using the
//! clock sync estimate, then drives the audio output when the wait elapses.
//! Transport actions (PLAY/PAUSE) and gain actions each own a single pending
//! slot; a newer action in a slot cancels the one it supersedes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::spatial::{gain_for_client, RESET_RAMP_SECONDS};
use crate::sync::{GainEntry, ScheduledAction};
use crate::time::LocalClock;

use super::output::{AudioOutput, DecodedAudio, PlaybackError};
use super::timer::PendingAction;

/// Where the local transport is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Stopped,
    /// A start is pending
    Armed,
    Playing,
}

/// Events emitted by the executor
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    /// A transport action ran
    Fired { kind: &'static str },
    /// The playing track reached its end
    TrackEnded { audio_id: String },
    /// Non-fatal failure while executing an action
    Error(String),
}

struct ExecutorState {
    phase: PlaybackPhase,
    client_id: Option<String>,
    library: HashMap<String, Arc<DecodedAudio>>,
    current_audio: Option<String>,
    /// Whether the output has a started source
    sounding: bool,
    /// Track offset playback started from
    start_offset: f64,
    /// Audio clock instant playback started at
    started_at: f64,
    /// Resume point once stopped
    paused_position: f64,
    transport: Option<PendingAction>,
    /// Last transport action accepted, with its execution instant
    last_transport: Option<(ScheduledAction, u64)>,
    gain: Option<PendingAction>,
    track_end: Option<PendingAction>,
}

impl ExecutorState {
    fn new() -> Self {
        Self {
            phase: PlaybackPhase::Stopped,
            client_id: None,
            library: HashMap::new(),
            current_audio: None,
            sounding: false,
            start_offset: 0.0,
            started_at: 0.0,
            paused_position: 0.0,
            transport: None,
            last_transport: None,
            gain: None,
            track_end: None,
        }
    }
}

fn cancel_slot(slot: &mut Option<PendingAction>) {
    if let Some(mut pending) = slot.take() {
        pending.cancel();
    }
}

struct Inner {
    output: Arc<dyn AudioOutput>,
    clock: SharedClock,
    local_clock: Arc<dyn LocalClock>,
    state: Mutex<ExecutorState>,
    event_tx: mpsc::UnboundedSender<ExecutorEvent>,
}

/// Executes scheduled actions against an audio output
#[derive(Clone)]
pub struct ScheduledExecutor {
    inner: Arc<Inner>,
}

impl ScheduledExecutor {
    pub fn new(
        output: Arc<dyn AudioOutput>,
        clock: SharedClock,
        local_clock: Arc<dyn LocalClock>,
    ) -> (Self, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let executor = Self {
            inner: Arc::new(Inner {
                output,
                clock,
                local_clock,
                state: Mutex::new(ExecutorState::new()),
                event_tx,
            }),
        };
        (executor, event_rx)
    }

    /// Our server-assigned id, used to pick our spatial gain entry
    pub fn set_client_id(&self, client_id: Option<String>) {
        self.inner.state.lock().client_id = client_id;
    }

    pub fn insert_buffer(&self, audio_id: String, buffer: Arc<DecodedAudio>) {
        self.inner.state.lock().library.insert(audio_id, buffer);
    }

    pub fn has_buffer(&self, audio_id: &str) -> bool {
        self.inner.state.lock().library.contains_key(audio_id)
    }

    pub fn clear_library(&self) {
        self.inner.state.lock().library.clear();
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.inner.state.lock().phase
    }

    pub fn current_audio(&self) -> Option<String> {
        self.inner.state.lock().current_audio.clone()
    }

    /// Where a resume would start from
    pub fn paused_position(&self) -> f64 {
        self.inner.state.lock().paused_position
    }

    /// Track position right now, in seconds
    pub fn current_position(&self) -> f64 {
        let state = self.inner.state.lock();
        if !state.sounding {
            return state.paused_position;
        }
        let elapsed = (self.inner.output.current_time() - state.started_at).max(0.0);
        state.start_offset + elapsed
    }

    /// Local wait until server time `server_time_ms`, never negative
    pub fn wait_for(&self, server_time_ms: u64) -> Duration {
        let local_now = self.inner.local_clock.now_ms();
        let wait_ms = self.inner.clock.read().wait_ms_at(server_time_ms, local_now);
        Duration::from_secs_f64(wait_ms / 1000.0)
    }

    /// Arm (or run, if already due) a server-scheduled action
    pub fn on_scheduled_action(
        &self,
        action: ScheduledAction,
        server_time_to_execute: u64,
    ) -> Result<(), PlaybackError> {
        // A redelivered transport action must not start or stop twice
        let key = action
            .is_transport()
            .then(|| (action.clone(), server_time_to_execute));
        if key.is_some() && self.inner.state.lock().last_transport == key {
            debug!("{} at {} already handled", action.kind(), server_time_to_execute);
            return Ok(());
        }

        let wait = self.wait_for(server_time_to_execute);
        debug!(
            "Scheduling {} in {:.1}ms",
            action.kind(),
            wait.as_secs_f64() * 1000.0
        );

        match action {
            ScheduledAction::Play {
                audio_id,
                track_time_seconds,
            } => {
                self.schedule_play(audio_id, track_time_seconds, wait)?;
                self.inner.state.lock().last_transport = key;
                Ok(())
            }
            ScheduledAction::Pause => {
                self.schedule_pause(wait);
                self.inner.state.lock().last_transport = key;
                Ok(())
            }
            ScheduledAction::SpatialConfig { gains, .. } => {
                self.schedule_gain(&gains, wait);
                Ok(())
            }
            ScheduledAction::SpatialConfigStop => {
                self.reset_gain();
                Ok(())
            }
        }
    }

    fn schedule_play(
        &self,
        audio_id: String,
        offset: f64,
        wait: Duration,
    ) -> Result<(), PlaybackError> {
        let mut state = self.inner.state.lock();
        let buffer = state
            .library
            .get(&audio_id)
            .cloned()
            .ok_or_else(|| PlaybackError::SourceNotLoaded(audio_id.clone()))?;

        cancel_slot(&mut state.transport);
        let at = self.inner.output.current_time() + wait.as_secs_f64();
        state.phase = PlaybackPhase::Armed;

        if wait.is_zero() {
            self.start_now(&mut state, &audio_id, buffer, at, offset);
            state.transport = Some(PendingAction::fired("PLAY"));
            return Ok(());
        }

        let executor = self.clone();
        state.transport = Some(PendingAction::spawn("PLAY", wait, move |ticket| {
            let mut state = executor.inner.state.lock();
            if ticket.claim() {
                executor.start_now(&mut state, &audio_id, buffer, at, offset);
            }
        }));
        Ok(())
    }

    fn start_now(
        &self,
        state: &mut ExecutorState,
        audio_id: &str,
        buffer: Arc<DecodedAudio>,
        at: f64,
        offset: f64,
    ) {
        cancel_slot(&mut state.track_end);

        let duration = buffer.duration_secs();
        let offset = offset.clamp(0.0, duration);
        if let Err(e) = self.inner.output.start(audio_id, buffer, at, offset) {
            warn!("Failed to start {}: {}", audio_id, e);
            state.phase = PlaybackPhase::Stopped;
            state.sounding = false;
            self.emit(ExecutorEvent::Error(e.to_string()));
            return;
        }

        info!("Playing {} from {:.2}s", audio_id, offset);
        state.phase = PlaybackPhase::Playing;
        state.sounding = true;
        state.current_audio = Some(audio_id.to_string());
        state.start_offset = offset;
        state.started_at = at;
        state.paused_position = offset;

        let lead = (at - self.inner.output.current_time()).max(0.0);
        let until_end = Duration::from_secs_f64(lead + (duration - offset));
        let executor = self.clone();
        let ended_id = audio_id.to_string();
        state.track_end = Some(PendingAction::spawn("TRACK_END", until_end, move |ticket| {
            let mut state = executor.inner.state.lock();
            if !ticket.claim() {
                return;
            }
            if !state.sounding || state.current_audio.as_deref() != Some(ended_id.as_str()) {
                return;
            }
            debug!("Track {} ended", ended_id);
            state.sounding = false;
            state.paused_position = 0.0;
            // A start armed meanwhile takes over; no auto-advance then
            if state.phase == PlaybackPhase::Playing {
                state.phase = PlaybackPhase::Stopped;
                executor.emit(ExecutorEvent::TrackEnded { audio_id: ended_id });
            }
        }));

        self.emit(ExecutorEvent::Fired { kind: "PLAY" });
    }

    fn schedule_pause(&self, wait: Duration) {
        let mut state = self.inner.state.lock();
        cancel_slot(&mut state.transport);
        if state.phase == PlaybackPhase::Armed {
            // The start it superseded never happened
            state.phase = if state.sounding {
                PlaybackPhase::Playing
            } else {
                PlaybackPhase::Stopped
            };
        }
        let at = self.inner.output.current_time() + wait.as_secs_f64();

        if wait.is_zero() {
            self.pause_now(&mut state, at);
            state.transport = Some(PendingAction::fired("PAUSE"));
            return;
        }

        let executor = self.clone();
        state.transport = Some(PendingAction::spawn("PAUSE", wait, move |ticket| {
            let mut state = executor.inner.state.lock();
            if ticket.claim() {
                executor.pause_now(&mut state, at);
            }
        }));
    }

    fn pause_now(&self, state: &mut ExecutorState, at: f64) {
        if state.sounding {
            self.inner.output.stop(at);
            cancel_slot(&mut state.track_end);
            state.sounding = false;

            let duration = state
                .current_audio
                .as_ref()
                .and_then(|id| state.library.get(id))
                .map_or(f64::MAX, |b| b.duration_secs());
            let elapsed = (at - state.started_at).max(0.0);
            state.paused_position = (state.start_offset + elapsed).min(duration);
            info!("Paused at {:.2}s", state.paused_position);
        }
        state.phase = PlaybackPhase::Stopped;
        self.emit(ExecutorEvent::Fired { kind: "PAUSE" });
    }

    fn schedule_gain(&self, gains: &HashMap<String, GainEntry>, wait: Duration) {
        let mut state = self.inner.state.lock();
        let Some(entry) = gain_for_client(gains, state.client_id.as_deref()) else {
            return;
        };

        cancel_slot(&mut state.gain);
        let at = self.inner.output.current_time() + wait.as_secs_f64();

        if wait.is_zero() {
            self.inner.output.ramp_gain(entry.gain, at, entry.ramp_time);
            state.gain = Some(PendingAction::fired("SPATIAL_CONFIG"));
            return;
        }

        let executor = self.clone();
        state.gain = Some(PendingAction::spawn("SPATIAL_CONFIG", wait, move |ticket| {
            let _state = executor.inner.state.lock();
            if ticket.claim() {
                executor.inner.output.ramp_gain(entry.gain, at, entry.ramp_time);
            }
        }));
    }

    /// Drop any pending gain change and ramp back to unity right away
    fn reset_gain(&self) {
        let mut state = self.inner.state.lock();
        cancel_slot(&mut state.gain);
        let now = self.inner.output.current_time();
        self.inner.output.ramp_gain(1.0, now, RESET_RAMP_SECONDS);
        debug!("Spatial audio stopped, gain reset");
    }

    /// Cancel everything and stop. The library is kept.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        cancel_slot(&mut state.transport);
        cancel_slot(&mut state.gain);
        cancel_slot(&mut state.track_end);
        state.last_transport = None;
        if state.sounding {
            self.inner.output.stop(self.inner.output.current_time());
        }
        state.phase = PlaybackPhase::Stopped;
        state.sounding = false;
        state.current_audio = None;
        state.start_offset = 0.0;
        state.started_at = 0.0;
        state.paused_position = 0.0;
    }

    fn emit(&self, event: ExecutorEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{new_shared_clock, NtpMeasurement};
    use crate::playback::output::{OutputCall, VirtualOutput};
    use crate::sync::Position;
    use crate::time::ManualClock;

    const SERVER_NOW: u64 = 1_000_000;

    /// Engine synced to a server `offset_ms` ahead of a device whose clock
    /// reads `local_now`
    fn synced_clock(offset_ms: i64, local_now: u64) -> SharedClock {
        let clock = new_shared_clock();
        {
            let mut engine = clock.write();
            for i in 0..3 {
                let t3 = local_now - 60 + i * 30;
                let t0 = t3 - 10;
                let t1 = (t0 as i64 + offset_ms + 5) as u64;
                engine.add_measurement(NtpMeasurement::new(t0, t1, t1, t3));
            }
        }
        clock
    }

    struct Device {
        executor: ScheduledExecutor,
        output: Arc<VirtualOutput>,
        local: Arc<ManualClock>,
        events: mpsc::UnboundedReceiver<ExecutorEvent>,
    }

    /// A device whose local clock is `skew_ms` behind the server
    fn device(skew_ms: i64) -> Device {
        let local_now = (SERVER_NOW as i64 - skew_ms) as u64;
        let output = Arc::new(VirtualOutput::new());
        let local = Arc::new(ManualClock::new(local_now));
        let (executor, events) =
            ScheduledExecutor::new(output.clone(), synced_clock(skew_ms, local_now), local.clone());
        executor.insert_buffer("a".into(), Arc::new(DecodedAudio::silence(1_000, 1, 60.0)));
        executor.insert_buffer("b".into(), Arc::new(DecodedAudio::silence(1_000, 1, 60.0)));
        Device {
            executor,
            output,
            local,
            events,
        }
    }

    fn play(audio_id: &str, track_time_seconds: f64) -> ScheduledAction {
        ScheduledAction::Play {
            audio_id: audio_id.into(),
            track_time_seconds,
        }
    }

    fn starts(output: &VirtualOutput) -> Vec<(String, f64, f64)> {
        output
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                OutputCall::Start { audio_id, at, offset } => Some((audio_id, at, offset)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_with_different_clocks_fire_together() {
        let devices: Vec<Device> = [0, 200, -350].into_iter().map(device).collect();
        for d in &devices {
            d.executor
                .on_scheduled_action(play("a", 3.0), SERVER_NOW + 750)
                .unwrap();
            assert_eq!(d.executor.phase(), PlaybackPhase::Armed);
        }

        tokio::time::sleep(Duration::from_millis(749)).await;
        assert!(devices.iter().all(|d| d.executor.phase() == PlaybackPhase::Armed));

        tokio::time::sleep(Duration::from_millis(2)).await;
        for d in &devices {
            assert_eq!(d.executor.phase(), PlaybackPhase::Playing);
            let started = starts(&d.output);
            assert_eq!(started.len(), 1);
            assert!((started[0].1 - 0.75).abs() < 1e-6, "start at {}", started[0].1);
            assert_eq!(started[0].2, 3.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_transport_action_supersedes_pending() {
        let mut d = device(0);
        d.executor.on_scheduled_action(play("a", 0.0), SERVER_NOW + 750).unwrap();
        d.executor.on_scheduled_action(play("b", 5.0), SERVER_NOW + 500).unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        let started = starts(&d.output);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, "b");
        assert_eq!(d.executor.current_audio().as_deref(), Some("b"));
        assert_eq!(d.events.try_recv().unwrap(), ExecutorEvent::Fired { kind: "PLAY" });
        assert!(d.events.try_recv().is_err());

        // A pause arriving before an armed start cancels it outright
        d.local.advance(800);
        d.executor.on_scheduled_action(play("a", 0.0), SERVER_NOW + 1_550).unwrap();
        d.executor.on_scheduled_action(ScheduledAction::Pause, SERVER_NOW + 1_300).unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(starts(&d.output).len(), 1);
        assert_eq!(d.executor.phase(), PlaybackPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_target_fires_immediately() {
        let d = device(200);
        d.executor
            .on_scheduled_action(play("a", 1.0), SERVER_NOW - 5_000)
            .unwrap();

        assert_eq!(d.executor.phase(), PlaybackPhase::Playing);
        let started = starts(&d.output);
        assert_eq!(started, vec![("a".to_string(), 0.0, 1.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_action_runs_once() {
        let mut d = device(200);
        d.executor
            .on_scheduled_action(play("a", 4.0), SERVER_NOW - 2_000)
            .unwrap();
        d.executor
            .on_scheduled_action(play("a", 4.0), SERVER_NOW - 2_000)
            .unwrap();

        assert_eq!(starts(&d.output), vec![("a".to_string(), 0.0, 4.0)]);
        assert_eq!(d.events.try_recv().unwrap(), ExecutorEvent::Fired { kind: "PLAY" });
        assert!(d.events.try_recv().is_err());

        // Same for a pause, including one still pending
        d.executor
            .on_scheduled_action(ScheduledAction::Pause, SERVER_NOW + 500)
            .unwrap();
        d.executor
            .on_scheduled_action(ScheduledAction::Pause, SERVER_NOW + 500)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let stops = d
            .output
            .calls()
            .into_iter()
            .filter(|c| matches!(c, OutputCall::Stop { .. }))
            .count();
        assert_eq!(stops, 1);
        assert_eq!(d.events.try_recv().unwrap(), ExecutorEvent::Fired { kind: "PAUSE" });
        assert!(d.events.try_recv().is_err());

        // A fresh instant is a new action
        d.executor
            .on_scheduled_action(play("a", 4.0), SERVER_NOW + 700)
            .unwrap();
        assert_eq!(d.executor.phase(), PlaybackPhase::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_records_resume_position() {
        let d = device(0);
        d.executor.on_scheduled_action(play("a", 10.0), SERVER_NOW).unwrap();

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        d.local.advance(2_000);
        assert!((d.executor.current_position() - 12.0).abs() < 1e-3);

        d.executor
            .on_scheduled_action(ScheduledAction::Pause, SERVER_NOW + 2_750)
            .unwrap();
        assert_eq!(d.executor.phase(), PlaybackPhase::Playing);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(d.executor.phase(), PlaybackPhase::Stopped);
        assert!((d.executor.paused_position() - 12.75).abs() < 1e-3);
        assert!(d
            .output
            .calls()
            .iter()
            .any(|c| matches!(c, OutputCall::Stop { at } if (at - 2.75).abs() < 1e-3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_end_is_reported() {
        let mut d = device(0);
        d.executor.insert_buffer("short".into(), Arc::new(DecodedAudio::silence(1_000, 1, 1.0)));
        d.executor.on_scheduled_action(play("short", 0.0), SERVER_NOW).unwrap();

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(d.events.recv().await, Some(ExecutorEvent::Fired { kind: "PLAY" }));
        assert_eq!(
            d.events.recv().await,
            Some(ExecutorEvent::TrackEnded {
                audio_id: "short".into()
            })
        );
        assert_eq!(d.executor.phase(), PlaybackPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_audio_is_not_executed() {
        let d = device(0);
        let result = d.executor.on_scheduled_action(play("missing", 0.0), SERVER_NOW + 100);
        assert!(matches!(result, Err(PlaybackError::SourceNotLoaded(ref id)) if id == "missing"));
        assert_eq!(d.executor.phase(), PlaybackPhase::Stopped);
        assert!(d.output.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spatial_gain_and_stop() {
        let d = device(0);
        d.executor.set_client_id(Some("me".into()));
        let gains: HashMap<String, GainEntry> = [("me", 0.3), ("other", 0.9)]
            .into_iter()
            .map(|(id, gain)| {
                (
                    id.to_string(),
                    GainEntry {
                        gain,
                        ramp_time: 0.25,
                    },
                )
            })
            .collect();
        let action = ScheduledAction::SpatialConfig {
            listening_source: Position::CENTER,
            gains: gains.clone(),
        };

        d.executor.on_scheduled_action(action, SERVER_NOW + 100).unwrap();
        assert_eq!(d.output.gain(), 1.0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(d.output.gain(), 0.3);

        d.executor
            .on_scheduled_action(ScheduledAction::SpatialConfigStop, SERVER_NOW)
            .unwrap();
        assert_eq!(d.output.gain(), 1.0);
        assert!(matches!(
            d.output.calls().last(),
            Some(OutputCall::Ramp { target, duration, .. }) if *target == 1.0 && *duration == 0.5
        ));

        // Without an entry of our own we follow the room average
        d.executor.set_client_id(Some("late".into()));
        d.local.advance(150);
        let action = ScheduledAction::SpatialConfig {
            listening_source: Position::CENTER,
            gains,
        };
        d.executor.on_scheduled_action(action, SERVER_NOW + 150).unwrap();
        assert!((d.output.gain() - 0.6).abs() < 1e-9);
    }
}
