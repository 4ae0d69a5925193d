//! Client playback
//!
//! Scheduled execution of server actions on a local audio output, plus the
//! local track queue.

mod executor;
mod output;
mod queue;
mod timer;

pub use executor::{ExecutorEvent, PlaybackPhase, ScheduledExecutor};
pub use output::{
    AudioDecoder, AudioOutput, DecodedAudio, OutputCall, PlaybackError, VirtualOutput, WavDecoder,
};
pub use queue::{QueueEntry, TrackQueue};
pub use timer::{PendingAction, TimerState, TimerTicket};
