//! Offline inspector for recorded takes
//!
//! Splits a take back into its audio and MIDI parts and prints the events it
//! carries, optionally exporting the channel messages as a Standard MIDI File.
//!
//! Usage:
//!   take_inspect <FILE> [--json] [--midi OUT.mid]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use midly::num::{u15, u24, u28};
use midly::live::LiveEvent;
use midly::{Format, Header, MetaMessage, Smf, Timing, TrackEvent, TrackEventKind};
use serde::Serialize;

use autotake_lib::recording::midi::channel_message_len;
use autotake_lib::recording::{decode, peak_amplitude, PlacedEvent};

/// Ticks per quarter note in exported MIDI files
const TICKS_PER_QUARTER: u16 = 480;
/// 120 BPM
const TEMPO_US_PER_QUARTER: u32 = 500_000;

#[derive(Debug, Parser)]
#[command(name = "take_inspect", version, about = "Decode the MIDI events carried in a take")]
struct Args {
    /// Take to inspect
    file: PathBuf,

    /// Print a JSON report instead of text
    #[arg(long)]
    json: bool,

    /// Export channel messages to a Standard MIDI File
    #[arg(long, value_name = "OUT.mid")]
    midi: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct EventRow {
    frame: usize,
    seconds: f64,
    bytes: [u8; 4],
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct Report {
    file: String,
    sample_rate: u32,
    channels: u16,
    frames: usize,
    duration_secs: f64,
    audio_peak: u16,
    events: Vec<EventRow>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    match inspect(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("take_inspect: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn inspect(args: &Args) -> anyhow::Result<()> {
    let mut reader = hound::WavReader::open(&args.file)
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    let spec = reader.spec();
    if spec.channels != 2
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        anyhow::bail!(
            "Not an interleaved take: {}ch {}-bit {:?}",
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format
        );
    }

    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .context("Failed to read samples")?;
    let decoded = decode(&samples);
    let sample_rate = spec.sample_rate;

    let report = Report {
        file: args.file.display().to_string(),
        sample_rate,
        channels: spec.channels,
        frames: decoded.audio.len(),
        duration_secs: decoded.audio.len() as f64 / sample_rate as f64,
        audio_peak: peak_amplitude(&decoded.audio).unwrap_or(0),
        events: decoded
            .events
            .iter()
            .map(|e| EventRow {
                frame: e.frame,
                seconds: e.frame as f64 / sample_rate as f64,
                bytes: e.data,
                kind: event_kind(e.data[0]),
            })
            .collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if let Some(out) = &args.midi {
        let written = export_midi(&decoded.events, sample_rate, out)?;
        if !args.json {
            println!("Wrote {} channel messages to {}", written, out.display());
        }
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!("{}", report.file);
    println!(
        "  {}Hz, {} frames ({:.2}s), audio peak {}",
        report.sample_rate, report.frames, report.duration_secs, report.audio_peak
    );
    println!("  {} MIDI payload(s)", report.events.len());
    for row in &report.events {
        println!(
            "  {:>10} {:>9.4}s  {:02X} {:02X} {:02X} {:02X}  {}",
            row.frame, row.seconds, row.bytes[0], row.bytes[1], row.bytes[2], row.bytes[3], row.kind
        );
    }
}

fn event_kind(status: u8) -> &'static str {
    match status {
        0x80..=0x8F => "note off",
        0x90..=0x9F => "note on",
        0xA0..=0xAF => "aftertouch",
        0xB0..=0xBF => "control change",
        0xC0..=0xCF => "program change",
        0xD0..=0xDF => "channel pressure",
        0xE0..=0xEF => "pitch bend",
        0xF0 => "sysex",
        0xF1..=0xFF => "system",
        _ => "continuation",
    }
}

/// Write the channel messages to a single-track SMF at 120 BPM. Returns the
/// number of messages written.
fn export_midi(events: &[PlacedEvent], sample_rate: u32, out: &Path) -> anyhow::Result<usize> {
    let ticks_per_sec = TICKS_PER_QUARTER as f64 * 1_000_000.0 / TEMPO_US_PER_QUARTER as f64;

    let mut track: Vec<TrackEvent> = vec![TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(TEMPO_US_PER_QUARTER))),
    }];

    let mut last_tick: u32 = 0;
    let mut written = 0;
    for event in events {
        let Some(len) = channel_message_len(event.data[0]) else {
            continue;
        };
        let Ok(LiveEvent::Midi { channel, message }) = LiveEvent::parse(&event.data[..len]) else {
            log::debug!("Skipping malformed payload at frame {}", event.frame);
            continue;
        };

        let seconds = event.frame as f64 / sample_rate as f64;
        let tick = (seconds * ticks_per_sec).round() as u32;
        track.push(TrackEvent {
            delta: u28::new(tick.saturating_sub(last_tick)),
            kind: TrackEventKind::Midi { channel, message },
        });
        last_tick = last_tick.max(tick);
        written += 1;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let timing = Timing::Metrical(u15::new(TICKS_PER_QUARTER));
    let mut smf = Smf::new(Header::new(Format::SingleTrack, timing));
    smf.tracks.push(track);
    smf.save(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    Ok(written)
}
