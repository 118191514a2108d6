// Device enumeration and stream opening on the system audio/MIDI backends

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use midir::{Ignore, MidiInput, MidiInputConnection};

use super::{
    AudioBlock, AudioCallback, AudioDevice, AudioStream, AudioStreamConfig, DeviceHost, MidiDevice,
    MidiInputStream, StreamClock,
};
use crate::recording::midi::{midi_queue, MidiOutlet, StampedMidi, MIDI_QUEUE_CAPACITY};

const MIDI_CLIENT_NAME: &str = "autotake";

/// Enumerate all available audio input devices
pub fn enumerate_audio_devices(host: &cpal::Host) -> Vec<AudioDevice> {
    let mut devices = Vec::new();

    let default_device_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let Ok(input_devices) = host.input_devices() else {
        log::warn!("Audio host returned no input devices");
        return devices;
    };

    for device in input_devices {
        let Ok(name) = device.name() else { continue };

        let max_input_channels = device
            .supported_input_configs()
            .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
            .unwrap_or(0);
        let max_output_channels = device
            .supported_output_configs()
            .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
            .unwrap_or(0);
        let default_sample_rate = device
            .default_input_config()
            .map(|c| c.sample_rate().0)
            .unwrap_or(0);

        let is_default = default_device_name.as_deref() == Some(name.as_str());

        devices.push(AudioDevice {
            id: name.clone(),
            name,
            max_input_channels,
            max_output_channels,
            default_sample_rate,
            is_default,
        });
    }

    devices
}

/// Enumerate all available MIDI input devices
pub fn enumerate_midi_devices() -> Vec<MidiDevice> {
    let mut devices = Vec::new();

    match MidiInput::new(&format!("{}-probe", MIDI_CLIENT_NAME)) {
        Ok(midi_in) => {
            for (index, port) in midi_in.ports().iter().enumerate() {
                if let Ok(name) = midi_in.port_name(port) {
                    devices.push(MidiDevice {
                        id: format!("midi-{}", index),
                        name,
                        port_index: index,
                        has_input: true,
                    });
                }
            }
        }
        Err(e) => log::warn!("MIDI backend unavailable: {}", e),
    }

    devices
}

/// Device host backed by cpal (audio) and midir (MIDI)
pub struct SystemHost {
    host: cpal::Host,
    audio: Vec<AudioDevice>,
    midi: Vec<MidiDevice>,
}

impl SystemHost {
    pub fn new() -> Self {
        let host = cpal::default_host();
        let audio = enumerate_audio_devices(&host);
        let midi = enumerate_midi_devices();
        Self { host, audio, midi }
    }

    fn find_cpal_device(&self, name: &str) -> anyhow::Result<cpal::Device> {
        self.host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("Audio device disappeared: {}", name))
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHost for SystemHost {
    fn refresh(&mut self) {
        // A fresh host re-queries the backend for hot-plugged devices
        self.host = cpal::default_host();
        self.audio = enumerate_audio_devices(&self.host);
        self.midi = enumerate_midi_devices();
    }

    fn audio_devices(&self) -> &[AudioDevice] {
        &self.audio
    }

    fn midi_devices(&self) -> &[MidiDevice] {
        &self.midi
    }

    fn open_audio(
        &mut self,
        device: &AudioDevice,
        config: &AudioStreamConfig,
        callback: AudioCallback,
    ) -> anyhow::Result<Box<dyn AudioStream>> {
        let cpal_device = self.find_cpal_device(&device.name)?;
        let (stream_config, sample_format) = choose_input_config(&cpal_device, config)?;
        let sample_rate = stream_config.sample_rate.0;
        let clock = StreamClock::new();
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match sample_format {
            cpal::SampleFormat::I16 => {
                build_input::<i16>(&cpal_device, &stream_config, clock, callback, failed.clone())?
            }
            cpal::SampleFormat::U16 => {
                build_input::<u16>(&cpal_device, &stream_config, clock, callback, failed.clone())?
            }
            cpal::SampleFormat::I32 => {
                build_input::<i32>(&cpal_device, &stream_config, clock, callback, failed.clone())?
            }
            cpal::SampleFormat::F32 => {
                build_input::<f32>(&cpal_device, &stream_config, clock, callback, failed.clone())?
            }
            other => anyhow::bail!("Unsupported sample format {:?} on {}", other, device.name),
        };

        log::info!(
            "Opened audio input: {} ({}Hz, {}ch, {:?}, {:?})",
            device.name,
            sample_rate,
            stream_config.channels,
            sample_format,
            stream_config.buffer_size
        );

        Ok(Box::new(CpalAudioStream {
            stream: Some(stream),
            started: false,
            failed,
            clock,
            sample_rate,
        }))
    }

    fn open_midi(
        &mut self,
        device: &MidiDevice,
        clock: StreamClock,
    ) -> anyhow::Result<Box<dyn MidiInputStream>> {
        let mut midi_in = MidiInput::new(MIDI_CLIENT_NAME)
            .map_err(|e| anyhow::anyhow!("Failed to create MIDI input: {}", e))?;
        midi_in.ignore(Ignore::ActiveSense);

        let ports = midi_in.ports();
        let port = ports
            .iter()
            .find(|p| midi_in.port_name(p).map(|n| n == device.name).unwrap_or(false))
            .or_else(|| ports.get(device.port_index))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("MIDI device disappeared: {}", device.name))?;

        let (mut inlet, outlet) = midi_queue(MIDI_QUEUE_CAPACITY, clock);
        let connection = midi_in
            .connect(
                &port,
                &format!("{}-input", MIDI_CLIENT_NAME),
                move |_stamp, message, _| inlet.push(message),
                (),
            )
            .map_err(|e| anyhow::anyhow!("Failed to connect MIDI input {}: {}", device.name, e))?;

        log::info!("Opened MIDI input: {}", device.name);
        Ok(Box::new(MidirInputStream {
            connection: Some(connection),
            outlet,
        }))
    }
}

/// Pick a stream config: mono at the default rate when offered, otherwise the
/// device default (channel 0 is captured).
fn choose_input_config(
    device: &cpal::Device,
    requested: &AudioStreamConfig,
) -> anyhow::Result<(cpal::StreamConfig, cpal::SampleFormat)> {
    let default = device.default_input_config()?;
    let rate = default.sample_rate();

    let supported = device
        .supported_input_configs()?
        .filter(|c| c.channels() == requested.input_channels)
        .filter(|c| c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
        .find(|c| is_convertible(c.sample_format()))
        .map(|c| c.with_sample_rate(rate))
        .unwrap_or(default);

    let buffer_size = match supported.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max }
            if (*min..=*max).contains(&requested.chunk_frames) =>
        {
            cpal::BufferSize::Fixed(requested.chunk_frames)
        }
        _ => cpal::BufferSize::Default,
    };

    let sample_format = supported.sample_format();
    let mut config = supported.config();
    config.buffer_size = buffer_size;
    Ok((config, sample_format))
}

fn is_convertible(format: cpal::SampleFormat) -> bool {
    matches!(
        format,
        cpal::SampleFormat::I16
            | cpal::SampleFormat::U16
            | cpal::SampleFormat::I32
            | cpal::SampleFormat::F32
    )
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    clock: StreamClock,
    mut callback: AudioCallback,
    failed: Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::SizedSample,
    i16: cpal::FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<i16> = Vec::new();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], info: &cpal::InputCallbackInfo| {
            let timestamp = info.timestamp();
            let latency = timestamp
                .callback
                .duration_since(&timestamp.capture)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let hw_time = clock.now_secs() - latency;

            mono.clear();
            mono.extend(data.iter().step_by(channels).map(|s| s.to_sample::<i16>()));
            callback(AudioBlock { samples: &mono, hw_time });
        },
        move |err| {
            log::error!("Audio stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                failed.store(true, Ordering::SeqCst);
            }
        },
        None,
    )?;
    Ok(stream)
}

/// Input stream on a cpal device
pub struct CpalAudioStream {
    stream: Option<cpal::Stream>,
    started: bool,
    failed: Arc<AtomicBool>,
    clock: StreamClock,
    sample_rate: u32,
}

impl AudioStream for CpalAudioStream {
    fn start(&mut self) -> anyhow::Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Audio stream already closed"))?;
        stream.play()?;
        self.started = true;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the stream joins the backend callback thread
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
        }
        self.started = false;
    }

    fn is_running(&self) -> bool {
        self.stream.is_some() && self.started && !self.failed.load(Ordering::SeqCst)
    }

    fn clock_time(&self) -> f64 {
        self.clock.now_secs()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn clock(&self) -> StreamClock {
        self.clock
    }
}

impl Drop for CpalAudioStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// MIDI input on a midir connection
pub struct MidirInputStream {
    connection: Option<MidiInputConnection<()>>,
    outlet: MidiOutlet,
}

impl MidiInputStream for MidirInputStream {
    fn read(&mut self, buf: &mut [StampedMidi]) -> usize {
        self.outlet.read(buf)
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.outlet.discard_pending();
    }
}

impl Drop for MidirInputStream {
    fn drop(&mut self) {
        self.close();
    }
}
