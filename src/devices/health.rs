// Device watchdog: detects dead or stalled input streams and reopens devices

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Serialize;

use super::{
    matches_patterns, AudioBlock, AudioCallback, AudioStream, AudioStreamConfig, DeviceHost,
    MidiInputStream, StreamClock,
};
use crate::recording::midi::{StampedMidi, MAX_MIDI_PER_BLOCK};
use crate::recording::TakeMonitor;

/// Liveness of the audio stream as seen by the watchdog.
///
/// `Alive -> AwaitingRestart` when the stream stops running or delivers no
/// block between two checks. `AwaitingRestart -> Alive` only when `restart`
/// opens and starts a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamHealth {
    Alive,
    AwaitingRestart,
}

type SharedMidi = Arc<Mutex<Option<Box<dyn MidiInputStream>>>>;

/// Owns the device handles and the audio callback registration
pub struct Watchdog<H: DeviceHost> {
    host: H,
    patterns: Vec<String>,
    stream_config: AudioStreamConfig,
    monitor: Arc<Mutex<TakeMonitor>>,
    audio: Option<Box<dyn AudioStream>>,
    midi: SharedMidi,
    active_audio: Option<String>,
    active_midi: Option<String>,
    /// Non-empty blocks delivered by the current stream
    blocks: Arc<AtomicU64>,
    blocks_at_last_check: u64,
    health: StreamHealth,
    restarts: u64,
}

impl<H: DeviceHost> Watchdog<H> {
    pub fn new(
        host: H,
        patterns: Vec<String>,
        chunk_frames: u32,
        monitor: Arc<Mutex<TakeMonitor>>,
    ) -> Self {
        Self {
            host,
            patterns,
            stream_config: AudioStreamConfig::mono_input(chunk_frames),
            monitor,
            audio: None,
            midi: Arc::new(Mutex::new(None)),
            active_audio: None,
            active_midi: None,
            blocks: Arc::new(AtomicU64::new(0)),
            blocks_at_last_check: 0,
            health: StreamHealth::AwaitingRestart,
            restarts: 0,
        }
    }

    pub fn health(&self) -> StreamHealth {
        self.health
    }

    /// Number of `restart` calls so far
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn active_audio_device(&self) -> Option<&str> {
        self.active_audio.as_deref()
    }

    pub fn active_midi_device(&self) -> Option<&str> {
        self.active_midi.as_deref()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn monitor(&self) -> &Arc<Mutex<TakeMonitor>> {
        &self.monitor
    }

    /// True while the stream runs and has delivered audio since the last
    /// check. A failure is reported once; after that the watchdog stays in
    /// `AwaitingRestart` until `restart` succeeds.
    pub fn is_alive(&mut self) -> bool {
        if self.health == StreamHealth::AwaitingRestart {
            return false;
        }

        let running = self.audio.as_ref().is_some_and(|s| s.is_running());
        if !running {
            log::warn!(
                "Audio stream stopped: {}",
                self.active_audio.as_deref().unwrap_or("<none>")
            );
            self.health = StreamHealth::AwaitingRestart;
            return false;
        }

        let blocks = self.blocks.load(Ordering::Relaxed);
        if blocks == self.blocks_at_last_check {
            log::warn!(
                "Audio stream stalled, no blocks since last check: {}",
                self.active_audio.as_deref().unwrap_or("<none>")
            );
            self.health = StreamHealth::AwaitingRestart;
            return false;
        }
        self.blocks_at_last_check = blocks;
        true
    }

    /// Close both streams, finish the open take, re-query the hardware and
    /// open the first matching audio and MIDI inputs.
    ///
    /// Safe to call repeatedly; with no matching device it leaves everything
    /// closed. Returns true if an audio stream is running afterwards.
    pub fn restart(&mut self) -> bool {
        self.restarts += 1;
        self.close_streams();
        self.host.refresh();
        self.log_devices();

        let clock = self.open_audio();
        self.open_midi(clock.unwrap_or_default());

        self.health == StreamHealth::Alive
    }

    /// Close everything and finish the open take
    pub fn shutdown(&mut self) {
        self.close_streams();
        self.health = StreamHealth::AwaitingRestart;
    }

    fn close_streams(&mut self) {
        // Audio first: once closed no callback can touch the monitor
        if let Some(mut audio) = self.audio.take() {
            audio.close();
            log::info!(
                "Closed audio input: {}",
                self.active_audio.as_deref().unwrap_or("<unknown>")
            );
        }
        self.active_audio = None;

        if let Some(mut midi) = self.midi.lock().take() {
            midi.close();
            log::info!("Closed MIDI input: {}", self.active_midi.as_deref().unwrap_or("<unknown>"));
        }
        self.active_midi = None;

        self.monitor.lock().end_take();
        self.health = StreamHealth::AwaitingRestart;
    }

    fn log_devices(&self) {
        let audio = self.host.audio_devices();
        log::info!("Audio devices: {}", audio.len());
        for device in audio {
            log::info!(
                "  audio: {} (in {}, out {}, {}Hz{})",
                device.name,
                device.max_input_channels,
                device.max_output_channels,
                device.default_sample_rate,
                if device.is_default { ", default" } else { "" }
            );
        }
        let midi = self.host.midi_devices();
        log::info!("MIDI devices: {}", midi.len());
        for device in midi {
            log::info!("  midi: {}", device.name);
        }
    }

    fn open_audio(&mut self) -> Option<StreamClock> {
        let device = self
            .host
            .audio_devices()
            .iter()
            .find(|d| d.has_input() && matches_patterns(&d.name, &self.patterns))
            .cloned();
        let Some(device) = device else {
            log::info!("No audio input matches {:?}", self.patterns);
            return None;
        };

        self.blocks.store(0, Ordering::Relaxed);
        self.blocks_at_last_check = 0;
        let callback = self.make_callback();

        let mut stream = match self.host.open_audio(&device, &self.stream_config, callback) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Failed to open audio input {}: {:#}", device.name, e);
                return None;
            }
        };

        // Rate must be in place before the first callback
        self.monitor.lock().set_sample_rate(stream.sample_rate());

        if let Err(e) = stream.start() {
            log::warn!("Failed to start audio input {}: {:#}", device.name, e);
            stream.close();
            return None;
        }

        log::info!("Audio input ready: {} ({}Hz)", device.name, stream.sample_rate());
        let clock = stream.clock();
        self.audio = Some(stream);
        self.active_audio = Some(device.name);
        self.health = StreamHealth::Alive;
        Some(clock)
    }

    fn open_midi(&mut self, clock: StreamClock) {
        let device = self
            .host
            .midi_devices()
            .iter()
            .find(|d| d.has_input && matches_patterns(&d.name, &self.patterns))
            .cloned();
        let Some(device) = device else {
            log::info!("No MIDI input matches {:?}", self.patterns);
            return;
        };

        match self.host.open_midi(&device, clock) {
            Ok(stream) => {
                *self.midi.lock() = Some(stream);
                self.active_midi = Some(device.name);
            }
            Err(e) => log::warn!("Failed to open MIDI input {}: {:#}", device.name, e),
        }
    }

    /// Real-time callback: drain MIDI, then hand the block to the monitor
    fn make_callback(&self) -> AudioCallback {
        let monitor = self.monitor.clone();
        let midi = self.midi.clone();
        let blocks = self.blocks.clone();
        let mut stamped = vec![StampedMidi::default(); MAX_MIDI_PER_BLOCK];

        Box::new(move |block: AudioBlock<'_>| {
            if block.samples.is_empty() {
                return;
            }
            blocks.fetch_add(1, Ordering::Relaxed);

            // The control thread only holds this while swapping streams
            let count = match midi.try_lock() {
                Some(mut guard) => guard.as_mut().map_or(0, |m| m.read(&mut stamped)),
                None => 0,
            };
            monitor.lock().process_block(&block, &stamped[..count]);
        })
    }
}

impl<H: DeviceHost> Drop for Watchdog<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Watchdog cycle: check liveness, restart if needed, sleep.
///
/// Returns once `shutdown` receives a message or all its senders are gone;
/// streams are closed and the open take finished before returning.
pub fn health_check_loop<H: DeviceHost>(
    watchdog: &mut Watchdog<H>,
    interval: Duration,
    shutdown: &Receiver<()>,
) {
    log::info!("Device watchdog started ({:?} interval)", interval);

    loop {
        if !watchdog.is_alive() {
            watchdog.restart();
        }

        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    watchdog.shutdown();
    log::info!("Device watchdog stopped after {} restart(s)", watchdog.restarts());
}
