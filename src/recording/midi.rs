// MIDI message model and the lock-free queue between the MIDI driver thread
// and the audio callback

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::devices::StreamClock;

/// Most messages placed into a single audio block
pub const MAX_MIDI_PER_BLOCK: usize = 128;

/// Bytes carried per message in the right channel
pub const MIDI_PAYLOAD_BYTES: usize = 4;

/// Default capacity of the driver-side queue
pub const MIDI_QUEUE_CAPACITY: usize = 4096;

/// A MIDI payload stamped with the stream clock on arrival
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StampedMidi {
    pub clock_secs: f64,
    pub data: [u8; MIDI_PAYLOAD_BYTES],
}

/// A MIDI payload with its timestamp relative to the take anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMsg {
    pub timestamp_ms: i32,
    pub data: [u8; MIDI_PAYLOAD_BYTES],
}

impl MidiMsg {
    /// Re-base a stamped message onto the take anchor `t0`
    pub fn from_stamped(stamped: &StampedMidi, anchor: f64) -> Self {
        let ms = ((stamped.clock_secs - anchor) * 1000.0).round();
        Self {
            timestamp_ms: ms.clamp(i32::MIN as f64, i32::MAX as f64) as i32,
            data: stamped.data,
        }
    }

    pub fn time_secs(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
}

/// Split a raw message into 4-byte payloads.
///
/// Short messages are zero padded; longer ones (SysEx) become consecutive
/// payloads.
pub fn pack_payloads(bytes: &[u8]) -> impl Iterator<Item = [u8; MIDI_PAYLOAD_BYTES]> + '_ {
    bytes.chunks(MIDI_PAYLOAD_BYTES).map(|chunk| {
        let mut payload = [0u8; MIDI_PAYLOAD_BYTES];
        payload[..chunk.len()].copy_from_slice(chunk);
        payload
    })
}

/// Length of a channel voice message from its status byte
pub fn channel_message_len(status: u8) -> Option<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Some(3),
        0xC0 | 0xD0 => Some(2),
        _ => None,
    }
}

/// Create the queue between a MIDI connection and the audio callback
pub fn midi_queue(capacity: usize, clock: StreamClock) -> (MidiInlet, MidiOutlet) {
    let (producer, consumer) = HeapRb::<StampedMidi>::new(capacity).split();
    let overflow = Arc::new(AtomicU64::new(0));
    (
        MidiInlet {
            producer,
            clock,
            overflow: overflow.clone(),
        },
        MidiOutlet {
            consumer,
            overflow,
            reported_overflow: 0,
        },
    )
}

/// Driver side: stamps and enqueues incoming messages
pub struct MidiInlet {
    producer: HeapProd<StampedMidi>,
    clock: StreamClock,
    overflow: Arc<AtomicU64>,
}

impl MidiInlet {
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let clock_secs = self.clock.now_secs();
        for data in pack_payloads(bytes) {
            if self.producer.try_push(StampedMidi { clock_secs, data }).is_err() {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Audio side: drains messages without blocking
pub struct MidiOutlet {
    consumer: HeapCons<StampedMidi>,
    overflow: Arc<AtomicU64>,
    reported_overflow: u64,
}

impl MidiOutlet {
    /// Drain everything pending, keeping at most `buf.len()` messages.
    pub fn read(&mut self, buf: &mut [StampedMidi]) -> usize {
        let count = self.consumer.pop_slice(buf);
        let dropped = self.discard_pending();
        if dropped > 0 {
            log::debug!("Dropped {} MIDI messages beyond block capacity", dropped);
        }
        let overflow = self.overflow.load(Ordering::Relaxed);
        if overflow > self.reported_overflow {
            log::warn!(
                "MIDI queue overflowed, {} messages lost so far",
                overflow
            );
            self.reported_overflow = overflow;
        }
        count
    }

    /// Throw away everything pending. Returns how many messages were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.consumer.try_pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Messages lost because the queue was full
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}
