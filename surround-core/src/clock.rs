//! Clock synchronization against the room server
//!
//! NTP-style probes measure round-trip delay and clock offset to the server.
//! Measurements live in a bounded, time-windowed set; high round trips are
//! rejected outright and the offset is a weighted average over the best half
//! of what remains, so asymmetric-path samples rarely contribute.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Measurements with a round trip above this are network glitches
pub const MAX_ROUND_TRIP_MS: f64 = 1000.0;

/// Measurements older than this are evicted
const MAX_MEASUREMENT_AGE_MS: u64 = 120_000;

/// Hard cap on stored measurements (oldest evicted first)
const MAX_MEASUREMENTS: usize = 50;

/// Live measurements required before an estimate is produced
const MIN_MEASUREMENTS_FOR_ESTIMATE: usize = 3;

/// Exponential decay constant for measurement age weighting
const AGE_DECAY_MS: f64 = 30_000.0;

/// Round trip scale for measurement quality weighting
const RTT_SCALE_MS: f64 = 100.0;

/// Drift is only recomputed when estimates are at least this far apart
const DRIFT_MIN_INTERVAL_MS: u64 = 5_000;

/// Cadence of probes while syncing
pub const PROBE_INTERVAL: Duration = Duration::from_millis(30);

/// Probing stops once this many responses have arrived
pub const PROBE_CEILING: usize = 40;

/// Probes sent per round may exceed the response ceiling by this factor
const MAX_PROBES_FACTOR: usize = 2;

/// An estimate older than this calls for a resync
const RESYNC_AFTER_MS: u64 = 60_000;

/// Fewer live measurements than this calls for a resync
const MIN_LIVE_MEASUREMENTS: usize = 5;

/// One completed probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NtpMeasurement {
    /// Local send time
    pub t0: u64,
    /// Server receive time
    pub t1: u64,
    /// Server send time
    pub t2: u64,
    /// Local receive time
    pub t3: u64,
    pub round_trip_ms: f64,
    /// Estimated `server - local` in milliseconds
    pub offset_ms: f64,
}

impl NtpMeasurement {
    pub fn new(t0: u64, t1: u64, t2: u64, t3: u64) -> Self {
        let (t0f, t1f, t2f, t3f) = (t0 as f64, t1 as f64, t2 as f64, t3 as f64);
        Self {
            t0,
            t1,
            t2,
            t3,
            round_trip_ms: (t3f - t0f) - (t2f - t1f),
            offset_ms: ((t1f - t0f) + (t2f - t3f)) / 2.0,
        }
    }

    /// Local time the measurement was completed
    pub fn recorded_at_ms(&self) -> u64 {
        self.t3
    }

    fn is_glitch(&self) -> bool {
        !(0.0..=MAX_ROUND_TRIP_MS).contains(&self.round_trip_ms)
    }
}

/// Quality tier of the current estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncQuality {
    #[default]
    Poor,
    Fair,
    Good,
    Excellent,
}

impl SyncQuality {
    /// Soft sync tolerance for this tier. Diagnostic only, never a gate.
    pub fn tolerance_ms(&self) -> f64 {
        match self {
            SyncQuality::Excellent => 25.0,
            SyncQuality::Good => 50.0,
            SyncQuality::Fair => 100.0,
            SyncQuality::Poor => 200.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncQuality::Excellent => "excellent",
            SyncQuality::Good => "good",
            SyncQuality::Fair => "fair",
            SyncQuality::Poor => "poor",
        }
    }

    fn classify(avg_rtt_ms: f64, offset_stddev_ms: f64) -> Self {
        if avg_rtt_ms < 50.0 && offset_stddev_ms < 10.0 {
            SyncQuality::Excellent
        } else if avg_rtt_ms < 100.0 && offset_stddev_ms < 25.0 {
            SyncQuality::Good
        } else if avg_rtt_ms < 200.0 && offset_stddev_ms < 50.0 {
            SyncQuality::Fair
        } else {
            SyncQuality::Poor
        }
    }
}

/// Filtered view of the server clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEstimate {
    /// `server - local` in milliseconds
    pub offset_ms: f64,
    /// Change of offset per second of local time
    pub drift: f64,
    pub round_trip_ms: f64,
    pub quality: SyncQuality,
    /// Live measurements behind this estimate
    pub sample_count: usize,
}

/// What happened to a recorded measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementOutcome {
    /// Round trip over the ceiling; not stored
    Rejected,
    /// Stored, but too few measurements to estimate yet
    Stored,
    /// Stored and the estimate was recomputed
    Updated(ClockEstimate),
}

/// Diagnostic snapshot of the sync engine
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub is_synced: bool,
    pub quality: SyncQuality,
    pub offset_ms: f64,
    pub drift: f64,
    /// Mean round trip over all live measurements
    pub latency_ms: f64,
    /// Standard deviation of live round trips
    pub jitter_ms: f64,
    pub tolerance_ms: f64,
    pub measurement_count: usize,
    pub rejected_count: usize,
    /// Milliseconds since the estimate last changed, if it ever has
    pub last_sync_age_ms: Option<u64>,
}

/// Per-client clock synchronization engine
#[derive(Debug)]
pub struct ClockSyncEngine {
    measurements: VecDeque<NtpMeasurement>,
    offset_ms: f64,
    drift: f64,
    round_trip_ms: f64,
    quality: SyncQuality,
    /// Local time of the last estimate update
    last_update_ms: Option<u64>,
    /// Responses this sync round, glitches included
    responses_received: usize,
    probes_sent: usize,
    rejected: usize,
    /// Responses per round before probing stops
    probe_ceiling: usize,
}

impl Default for ClockSyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSyncEngine {
    pub fn new() -> Self {
        Self::with_probe_ceiling(PROBE_CEILING)
    }

    pub fn with_probe_ceiling(probe_ceiling: usize) -> Self {
        Self {
            measurements: VecDeque::new(),
            offset_ms: 0.0,
            drift: 0.0,
            round_trip_ms: 0.0,
            quality: SyncQuality::Poor,
            last_update_ms: None,
            responses_received: 0,
            probes_sent: 0,
            rejected: 0,
            probe_ceiling: probe_ceiling.max(1),
        }
    }

    /// Start a probe. Returns the `t0` to put in the NTP request.
    pub fn create_probe(&mut self, now_ms: u64) -> u64 {
        self.probes_sent += 1;
        now_ms
    }

    /// Record a server response received at local time `t3`
    pub fn record_response(&mut self, t0: u64, t1: u64, t2: u64, t3: u64) -> MeasurementOutcome {
        self.add_measurement(NtpMeasurement::new(t0, t1, t2, t3))
    }

    /// Add a completed measurement and refresh the estimate
    pub fn add_measurement(&mut self, measurement: NtpMeasurement) -> MeasurementOutcome {
        self.responses_received += 1;

        if measurement.is_glitch() {
            self.rejected += 1;
            tracing::debug!(
                "Discarding NTP measurement with RTT={:.1}ms",
                measurement.round_trip_ms
            );
            return MeasurementOutcome::Rejected;
        }

        let now_ms = measurement.recorded_at_ms();
        self.measurements.push_back(measurement);
        self.evict(now_ms);
        self.update_estimate(now_ms)
    }

    fn evict(&mut self, now_ms: u64) {
        self.measurements
            .retain(|m| now_ms.saturating_sub(m.recorded_at_ms()) < MAX_MEASUREMENT_AGE_MS);
        while self.measurements.len() > MAX_MEASUREMENTS {
            self.measurements.pop_front();
        }
    }

    /// Best half of the live measurements by round trip (ceil(n/2))
    pub fn working_set(&self) -> Vec<NtpMeasurement> {
        let mut sorted: Vec<NtpMeasurement> = self.measurements.iter().copied().collect();
        sorted.sort_by(|a, b| a.round_trip_ms.total_cmp(&b.round_trip_ms));
        sorted.truncate(sorted.len().div_ceil(2));
        sorted
    }

    fn update_estimate(&mut self, now_ms: u64) -> MeasurementOutcome {
        if self.measurements.len() < MIN_MEASUREMENTS_FOR_ESTIMATE {
            return MeasurementOutcome::Stored;
        }

        let best = self.working_set();

        let mut total_weight = 0.0;
        let mut weighted_offset = 0.0;
        for m in &best {
            let age_ms = now_ms.saturating_sub(m.recorded_at_ms()) as f64;
            let age_weight = (-age_ms / AGE_DECAY_MS).exp();
            let rtt_weight = 1.0 / (1.0 + m.round_trip_ms / RTT_SCALE_MS);
            let weight = age_weight * rtt_weight;
            weighted_offset += m.offset_ms * weight;
            total_weight += weight;
        }

        if total_weight <= 0.0 {
            return MeasurementOutcome::Stored;
        }
        let new_offset = weighted_offset / total_weight;

        if let Some(last) = self.last_update_ms {
            let elapsed_ms = now_ms.saturating_sub(last);
            if elapsed_ms >= DRIFT_MIN_INTERVAL_MS {
                self.drift = (new_offset - self.offset_ms) / (elapsed_ms as f64 / 1000.0);
            }
        }

        let rtts: Vec<f64> = best.iter().map(|m| m.round_trip_ms).collect();
        let offsets: Vec<f64> = best.iter().map(|m| m.offset_ms).collect();
        let avg_rtt = mean(&rtts);

        self.offset_ms = new_offset;
        self.round_trip_ms = avg_rtt;
        self.last_update_ms = Some(now_ms);
        self.quality = SyncQuality::classify(avg_rtt, std_dev(&offsets));

        tracing::debug!(
            "Clock estimate: offset={:.1}ms drift={:.3}ms/s rtt={:.1}ms quality={} (n={})",
            self.offset_ms,
            self.drift,
            self.round_trip_ms,
            self.quality.as_str(),
            self.measurements.len()
        );

        MeasurementOutcome::Updated(self.estimate())
    }

    /// Current estimate
    pub fn estimate(&self) -> ClockEstimate {
        ClockEstimate {
            offset_ms: self.offset_ms,
            drift: self.drift,
            round_trip_ms: self.round_trip_ms,
            quality: self.quality,
            sample_count: self.measurements.len(),
        }
    }

    /// Server time corresponding to local time `local_ms`, drift included
    pub fn server_time_at(&self, local_ms: u64) -> f64 {
        let drift_adjustment = match self.last_update_ms {
            Some(last) => self.drift * ((local_ms as f64 - last as f64) / 1000.0),
            None => 0.0,
        };
        local_ms as f64 + self.offset_ms + drift_adjustment
    }

    /// Server time right now
    pub fn server_time_now(&self) -> f64 {
        self.server_time_at(crate::time::current_time_ms())
    }

    /// Milliseconds to wait at local time `local_ms` until server time
    /// `target_server_ms`. Never negative.
    pub fn wait_ms_at(&self, target_server_ms: u64, local_ms: u64) -> f64 {
        (target_server_ms as f64 - self.server_time_at(local_ms)).max(0.0)
    }

    /// Whether the probe loop should send another probe
    pub fn should_probe(&self) -> bool {
        self.responses_received < self.probe_ceiling
            && self.probes_sent < self.probe_ceiling * MAX_PROBES_FACTOR
    }

    /// Whether the estimate is stale or weak enough to warrant a new round
    pub fn needs_resync(&self, now_ms: u64) -> bool {
        let stale = match self.last_update_ms {
            Some(last) => now_ms.saturating_sub(last) > RESYNC_AFTER_MS,
            None => true,
        };
        self.quality == SyncQuality::Poor || stale || self.measurements.len() < MIN_LIVE_MEASUREMENTS
    }

    /// Start a new probe round if a resync is needed. Returns true if probing
    /// should resume.
    pub fn force_resync(&mut self, now_ms: u64) -> bool {
        if !self.needs_resync(now_ms) {
            return false;
        }
        self.responses_received = 0;
        self.probes_sent = 0;
        true
    }

    pub fn status(&self, now_ms: u64) -> SyncStatus {
        let rtts: Vec<f64> = self.measurements.iter().map(|m| m.round_trip_ms).collect();
        SyncStatus {
            is_synced: self.measurements.len() >= MIN_LIVE_MEASUREMENTS,
            quality: self.quality,
            offset_ms: self.offset_ms,
            drift: self.drift,
            latency_ms: if rtts.is_empty() { 0.0 } else { mean(&rtts) },
            jitter_ms: if rtts.len() > 1 { std_dev(&rtts) } else { 0.0 },
            tolerance_ms: self.quality.tolerance_ms(),
            measurement_count: self.measurements.len(),
            rejected_count: self.rejected,
            last_sync_age_ms: self.last_update_ms.map(|last| now_ms.saturating_sub(last)),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Thread-safe wrapper for ClockSyncEngine
pub type SharedClock = Arc<RwLock<ClockSyncEngine>>;

/// Create a new shared sync engine
pub fn new_shared_clock() -> SharedClock {
    Arc::new(RwLock::new(ClockSyncEngine::new()))
}

/// Create a shared sync engine with a custom probe ceiling
pub fn new_shared_clock_with_ceiling(probe_ceiling: usize) -> SharedClock {
    Arc::new(RwLock::new(ClockSyncEngine::with_probe_ceiling(probe_ceiling)))
}
