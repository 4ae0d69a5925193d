//! Audio decode and output seams
//!
//! The executor only needs two primitives from an audio graph: start a
//! buffer at a local audio-clock instant from a track offset, and ramp the
//! master gain. Decoding is likewise pluggable.

use std::io::Cursor;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Audio source not loaded: {0}")]
    SourceNotLoaded(String),
    #[error("Failed to decode {name}: {reason}")]
    Decode { name: String, reason: String },
    #[error("Audio output error: {0}")]
    Output(String),
}

/// Decoded PCM, one sample vector per channel
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Silent buffer of the given length
    pub fn silence(sample_rate: u32, channels: usize, duration_secs: f64) -> Self {
        let frames = (duration_secs * sample_rate as f64).round() as usize;
        Self {
            sample_rate,
            channels: vec![vec![0.0; frames]; channels],
        }
    }
}

/// Turns uploaded bytes into PCM
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, name: &str, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError>;
}

/// The two primitives the executor drives. Times are seconds on the
/// output's own audio clock.
pub trait AudioOutput: Send + Sync {
    /// Current audio clock
    fn current_time(&self) -> f64;

    /// Start `buffer` at audio time `at`, `offset_secs` into the track.
    /// Replaces whatever is currently playing.
    fn start(
        &self,
        audio_id: &str,
        buffer: Arc<DecodedAudio>,
        at: f64,
        offset_secs: f64,
    ) -> Result<(), PlaybackError>;

    /// Stop playback at audio time `at`
    fn stop(&self, at: f64);

    /// Ramp the master gain to `target` starting at `at`
    fn ramp_gain(&self, target: f64, at: f64, duration_secs: f64);

    fn gain(&self) -> f64;
}

/// WAV decoder backed by `hound`
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn decode(&self, name: &str, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
        let decode_err = |reason: String| PlaybackError::Decode {
            name: name.to_string(),
            reason,
        };

        let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| decode_err(e.to_string()))?;
        let spec = reader.spec();
        let channel_count = spec.channels as usize;
        if channel_count == 0 {
            return Err(decode_err("no channels".to_string()));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / max_val))
                    .collect::<Result<_, _>>()
                    .map_err(|e| decode_err(e.to_string()))?
            }
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| decode_err(e.to_string()))?,
        };

        let mut channels = vec![Vec::with_capacity(interleaved.len() / channel_count); channel_count];
        for frame in interleaved.chunks_exact(channel_count) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }

        Ok(DecodedAudio {
            sample_rate: spec.sample_rate,
            channels,
        })
    }
}

/// A call recorded by [`VirtualOutput`]
#[derive(Debug, Clone, PartialEq)]
pub enum OutputCall {
    Start { audio_id: String, at: f64, offset: f64 },
    Stop { at: f64 },
    Ramp { target: f64, at: f64, duration: f64 },
}

/// Output with no device behind it. Keeps time with the tokio clock and
/// records every call; used by headless clients and in tests.
pub struct VirtualOutput {
    origin: tokio::time::Instant,
    gain: Mutex<f64>,
    calls: Mutex<Vec<OutputCall>>,
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            gain: Mutex::new(1.0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<OutputCall> {
        self.calls.lock().clone()
    }
}

impl Default for VirtualOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(
        &self,
        audio_id: &str,
        _buffer: Arc<DecodedAudio>,
        at: f64,
        offset_secs: f64,
    ) -> Result<(), PlaybackError> {
        self.calls.lock().push(OutputCall::Start {
            audio_id: audio_id.to_string(),
            at,
            offset: offset_secs,
        });
        Ok(())
    }

    fn stop(&self, at: f64) {
        self.calls.lock().push(OutputCall::Stop { at });
    }

    fn ramp_gain(&self, target: f64, at: f64, duration_secs: f64) {
        *self.gain.lock() = target;
        self.calls.lock().push(OutputCall::Ramp {
            target,
            at,
            duration: duration_secs,
        });
    }

    fn gain(&self) -> f64 {
        *self.gain.lock()
    }
}
