// Amplitude-triggered take controller driven by the audio callback

use std::path::PathBuf;

use super::activity::{peak_amplitude, IdleTracker, DEFAULT_TRIGGER_THRESHOLD};
use super::interleave::{interleave, BlockTiming};
use super::midi::{MidiMsg, StampedMidi, MAX_MIDI_PER_BLOCK};
use super::writer::{TakeFormat, TakeOpener, TakeSink};
use super::RecordingStatus;
use crate::devices::AudioBlock;

/// Start/stop policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeSettings {
    /// Peak amplitude a block must exceed to count as activity
    pub trigger_threshold: u16,
    /// Idle time at or below which a take starts, and above which it stops
    pub max_idle_secs: f64,
    /// Longest single take, measured on the stream clock
    pub max_take_secs: f64,
}

impl Default for TakeSettings {
    fn default() -> Self {
        Self {
            trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            max_idle_secs: 2.0,
            max_take_secs: 10.0,
        }
    }
}

/// Counters since the monitor was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakeStats {
    pub takes_started: u64,
    pub takes_finished: u64,
    pub open_failures: u64,
    pub write_failures: u64,
    pub blocks_written: u64,
    pub midi_placed: u64,
    pub midi_dropped: u64,
}

/// Recording session state: idle accumulator, the open take and its anchor.
///
/// Owned behind a mutex shared by the audio callback (`process_block`) and the
/// watchdog (`end_take`, `set_sample_rate`). The watchdog only touches it while
/// no stream is delivering blocks.
pub struct TakeMonitor {
    settings: TakeSettings,
    idle: IdleTracker,
    sample_rate: u32,
    status: RecordingStatus,
    /// Stream time of the first block of the open take (`t0`)
    anchor: f64,
    opener: Box<dyn TakeOpener>,
    sink: Option<Box<dyn TakeSink>>,
    midi_scratch: Vec<MidiMsg>,
    stats: TakeStats,
}

impl TakeMonitor {
    pub fn new(settings: TakeSettings, opener: Box<dyn TakeOpener>) -> Self {
        Self {
            idle: IdleTracker::new(settings.trigger_threshold),
            settings,
            sample_rate: 0,
            status: RecordingStatus::Idle,
            anchor: 0.0,
            opener,
            sink: None,
            midi_scratch: Vec::with_capacity(MAX_MIDI_PER_BLOCK),
            stats: TakeStats::default(),
        }
    }

    pub fn settings(&self) -> &TakeSettings {
        &self.settings
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    pub fn is_recording(&self) -> bool {
        self.status == RecordingStatus::Recording
    }

    pub fn idle_secs(&self) -> f64 {
        self.idle.idle_secs()
    }

    /// Take anchor `t0`, if a take is open
    pub fn anchor(&self) -> Option<f64> {
        self.is_recording().then_some(self.anchor)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn stats(&self) -> TakeStats {
        self.stats
    }

    /// Path of the open take
    pub fn current_take(&self) -> Option<PathBuf> {
        self.sink.as_ref().map(|s| s.path().to_path_buf())
    }

    /// Record the rate negotiated by a freshly opened stream. Resets the idle
    /// accumulator so a new device does not inherit the old one's history.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.idle.reset();
    }

    /// Handle one captured block and the MIDI that arrived during it.
    ///
    /// Runs the activity update, then the start and stop transitions, then
    /// merges and appends the block if a take is open. Empty blocks are ignored.
    pub fn process_block(
        &mut self,
        block: &AudioBlock<'_>,
        midi: &[StampedMidi],
    ) -> RecordingStatus {
        let Some(peak) = peak_amplitude(block.samples) else {
            return self.status;
        };
        let frames = block.samples.len();
        let t = block.hw_time;
        let idle = self.idle.update(peak, frames, self.sample_rate);

        if idle <= self.settings.max_idle_secs && !self.is_recording() {
            self.begin_take(t);
        }

        if self.is_recording() {
            let too_long = t - self.anchor > self.settings.max_take_secs;
            if idle > self.settings.max_idle_secs || too_long {
                if too_long {
                    log::info!("Take reached {:.1}s cap", self.settings.max_take_secs);
                }
                self.end_take();
            }
        }

        if self.is_recording() {
            self.append_block(block, midi);
        }

        self.status
    }

    /// Finalize the open take, if any
    pub fn end_take(&mut self) {
        let Some(sink) = self.sink.take() else {
            self.status = RecordingStatus::Idle;
            return;
        };
        self.status = RecordingStatus::Idle;

        let path = sink.path().to_path_buf();
        match sink.finish() {
            Ok(()) => {
                self.stats.takes_finished += 1;
                log::info!("Stop recording: {}", path.display());
            }
            Err(e) => {
                log::warn!("Failed to finish take {}: {}", path.display(), e);
            }
        }
    }

    fn begin_take(&mut self, t: f64) {
        match self.opener.open(TakeFormat::interleaved(self.sample_rate)) {
            Ok(sink) => {
                log::info!("Start recording: {}", sink.path().display());
                self.sink = Some(sink);
                self.anchor = t;
                self.status = RecordingStatus::Recording;
                self.stats.takes_started += 1;
            }
            Err(e) => {
                // Retried on the next qualifying block
                self.stats.open_failures += 1;
                log::warn!("Failed to open take: {}", e);
            }
        }
    }

    fn append_block(&mut self, block: &AudioBlock<'_>, midi: &[StampedMidi]) {
        let anchor = self.anchor;
        self.midi_scratch.clear();
        self.midi_scratch
            .extend(midi.iter().take(MAX_MIDI_PER_BLOCK).map(|m| MidiMsg::from_stamped(m, anchor)));

        let timing = BlockTiming {
            block_time: block.hw_time,
            anchor,
            sample_rate: self.sample_rate,
        };
        let merged = interleave(block.samples, &self.midi_scratch, &timing);
        let dropped = merged.dropped + midi.len().saturating_sub(MAX_MIDI_PER_BLOCK);
        self.stats.midi_placed += merged.slots.len() as u64;
        if dropped > 0 {
            self.stats.midi_dropped += dropped as u64;
            log::debug!(
                "{} MIDI messages did not fit into a {}-frame block",
                dropped,
                block.samples.len()
            );
        }

        let Some(sink) = self.sink.as_mut() else { return };
        match sink.append(merged.samples) {
            Ok(()) => self.stats.blocks_written += 1,
            Err(e) => {
                self.stats.write_failures += 1;
                log::warn!("Write to {} failed, abandoning take: {}", sink.path().display(), e);
                self.end_take();
            }
        }
    }
}

impl Drop for TakeMonitor {
    fn drop(&mut self) {
        self.end_take();
    }
}
