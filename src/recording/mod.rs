// Recording modules

pub mod activity;
pub mod interleave;
pub mod midi;
pub mod monitor;
pub mod writer;

pub use activity::{peak_amplitude, IdleTracker};
pub use interleave::{decode, interleave, BlockTiming, DecodedBlock, InterleavedBlock, PlacedEvent};
pub use midi::{MidiMsg, StampedMidi};
pub use monitor::{TakeMonitor, TakeSettings, TakeStats};
pub use writer::{
    DirectTakeOpener, QueuedTakeOpener, TakeFormat, TakeOpener, TakeSink, TakeWriterThread,
    WavTakeSink,
};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current recording state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Waiting for activity
    Idle,
    /// A take is open and receiving blocks
    Recording,
}

/// Failures of a take's output stream. Always scoped to one take.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("take writer thread is no longer running")]
    WriterGone,

    #[error("writer thread failed to write {}", .0.display())]
    WriteFailed(PathBuf),

    #[error("invalid take format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, RecordingError>;
