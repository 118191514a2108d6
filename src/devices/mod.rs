// Device discovery, stream interfaces and the device watchdog

pub mod enumeration;
pub mod health;

pub use enumeration::*;
pub use health::{health_check_loop, StreamHealth, Watchdog};

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::recording::midi::StampedMidi;

/// Represents an audio input device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub default_sample_rate: u32,
    pub is_default: bool,
}

impl AudioDevice {
    pub fn has_input(&self) -> bool {
        self.max_input_channels > 0
    }
}

/// Represents a MIDI input device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidiDevice {
    pub id: String,
    pub name: String,
    pub port_index: usize,
    pub has_input: bool,
}

/// True if any pattern is a substring of `name`.
pub fn matches_patterns(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| name.contains(p.as_str()))
}

/// Monotonic clock whose origin is the moment an audio stream was opened.
///
/// One clock is created per watchdog restart and shared by the audio stream
/// and the MIDI input, so block times and MIDI arrival times are comparable.
#[derive(Debug, Clone, Copy)]
pub struct StreamClock {
    origin: Instant,
}

impl StreamClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Seconds elapsed since the stream was opened
    pub fn now_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One captured block of mono samples
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock<'a> {
    pub samples: &'a [i16],
    /// Stream clock time of the first sample in the block
    pub hw_time: f64,
}

/// Real-time callback invoked for every captured block
pub type AudioCallback = Box<dyn FnMut(AudioBlock<'_>) + Send + 'static>;

/// Requested stream layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamConfig {
    pub input_channels: u16,
    pub output_channels: u16,
    pub chunk_frames: u32,
}

impl AudioStreamConfig {
    /// Mono capture, no playback
    pub fn mono_input(chunk_frames: u32) -> Self {
        Self {
            input_channels: 1,
            output_channels: 0,
            chunk_frames,
        }
    }
}

/// An opened audio input stream.
///
/// After `close` returns the registered callback must never run again.
pub trait AudioStream {
    fn start(&mut self) -> anyhow::Result<()>;
    fn close(&mut self);
    fn is_running(&self) -> bool;
    fn clock_time(&self) -> f64;
    /// Sample rate negotiated at open time
    fn sample_rate(&self) -> u32;
    fn clock(&self) -> StreamClock;
}

/// An opened MIDI input.
pub trait MidiInputStream: Send {
    /// Drain pending messages into `buf`. At most `buf.len()` are kept and
    /// anything beyond that is dropped. Never blocks.
    fn read(&mut self, buf: &mut [StampedMidi]) -> usize;
    fn close(&mut self);
}

/// Device enumeration and stream factory
pub trait DeviceHost {
    /// Re-query the hardware
    fn refresh(&mut self);
    fn audio_devices(&self) -> &[AudioDevice];
    fn midi_devices(&self) -> &[MidiDevice];
    fn open_audio(
        &mut self,
        device: &AudioDevice,
        config: &AudioStreamConfig,
        callback: AudioCallback,
    ) -> anyhow::Result<Box<dyn AudioStream>>;
    fn open_midi(
        &mut self,
        device: &MidiDevice,
        clock: StreamClock,
    ) -> anyhow::Result<Box<dyn MidiInputStream>>;
}
