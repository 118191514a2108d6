// Merge of mono audio and MIDI payloads into one interleaved stereo block.
//
// Left channel carries the audio untouched. The right channel is silence (-1)
// except at 4-frame slots, where each frame holds one payload byte of a MIDI
// message placed at the sample offset derived from its timestamp.

use serde::Serialize;

use super::midi::{MidiMsg, MIDI_PAYLOAD_BYTES};

/// Frames per MIDI slot
pub const SLOT_FRAMES: usize = MIDI_PAYLOAD_BYTES;

/// Right channel value where no MIDI byte is present
pub const SILENCE: i16 = -1;

/// Timing of the block being merged
#[derive(Debug, Clone, Copy)]
pub struct BlockTiming {
    /// Stream time of the block's first frame
    pub block_time: f64,
    /// Stream time the take started (`t0`)
    pub anchor: f64,
    pub sample_rate: u32,
}

/// Result of merging one block
#[derive(Debug, Clone)]
pub struct InterleavedBlock {
    pub samples: Vec<i16>,
    /// Slot assigned to each placed message, in input order
    pub slots: Vec<usize>,
    /// Messages that did not fit into the block
    pub dropped: usize,
}

/// Number of 4-frame slots in a block of `frames` frames
pub fn slot_capacity(frames: usize) -> usize {
    frames / SLOT_FRAMES
}

/// Unclamped slot for a message time relative to the anchor
pub fn raw_slot(message_secs: f64, timing: &BlockTiming) -> i64 {
    let offset = message_secs + timing.anchor - timing.block_time;
    (offset * timing.sample_rate as f64 / SLOT_FRAMES as f64).round() as i64
}

/// Clamp a raw slot for message `index` of `placed` messages.
///
/// The lower bound keeps slots strictly increasing; the upper bound leaves one
/// slot free for each later message. Requires `placed <= capacity` and
/// `previous < capacity - placed + index` when present.
pub fn clamp_slot(
    raw: i64,
    index: usize,
    placed: usize,
    capacity: usize,
    previous: Option<usize>,
) -> usize {
    let lower = previous.map_or(index, |p| index.max(p + 1));
    let upper = capacity - placed + index;
    raw.clamp(lower as i64, upper as i64) as usize
}

/// Merge a block of audio with the MIDI messages that arrived during it.
///
/// At most `slot_capacity(audio.len())` messages are placed; the rest are
/// counted in `dropped`.
pub fn interleave(audio: &[i16], messages: &[MidiMsg], timing: &BlockTiming) -> InterleavedBlock {
    let frames = audio.len();
    let mut samples = Vec::with_capacity(frames * 2);
    for &sample in audio {
        samples.push(sample);
        samples.push(SILENCE);
    }

    let capacity = slot_capacity(frames);
    let placed = messages.len().min(capacity);
    let mut slots = Vec::with_capacity(placed);
    let mut previous = None;

    for (index, msg) in messages.iter().take(placed).enumerate() {
        let slot = clamp_slot(raw_slot(msg.time_secs(), timing), index, placed, capacity, previous);
        for (j, &byte) in msg.data.iter().enumerate() {
            samples[(slot * SLOT_FRAMES + j) * 2 + 1] = byte as i16;
        }
        slots.push(slot);
        previous = Some(slot);
    }

    InterleavedBlock {
        samples,
        slots,
        dropped: messages.len() - placed,
    }
}

/// A MIDI payload recovered from the right channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlacedEvent {
    /// Frame of the first payload byte, from the start of the decoded buffer
    pub frame: usize,
    pub data: [u8; MIDI_PAYLOAD_BYTES],
}

/// Audio and events separated out of an interleaved buffer
#[derive(Debug, Clone, Default)]
pub struct DecodedBlock {
    pub audio: Vec<i16>,
    pub events: Vec<PlacedEvent>,
}

/// Split an interleaved buffer back into audio and MIDI events.
///
/// The right channel is scanned frame by frame; the first non-silent frame
/// starts a payload that spans the next 4 frames, so concatenated blocks of
/// any length decode correctly. A trailing odd sample is ignored.
pub fn decode(interleaved: &[i16]) -> DecodedBlock {
    let frames = interleaved.len() / 2;
    let mut audio = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    for frame in interleaved.chunks_exact(2) {
        audio.push(frame[0]);
        right.push(frame[1]);
    }

    let mut events = Vec::new();
    let mut frame = 0;
    while frame < right.len() {
        if right[frame] == SILENCE {
            frame += 1;
            continue;
        }
        let mut data = [0u8; MIDI_PAYLOAD_BYTES];
        for (byte, &value) in data.iter_mut().zip(&right[frame..]) {
            *byte = if value == SILENCE { 0 } else { value as u8 };
        }
        events.push(PlacedEvent { frame, data });
        frame += SLOT_FRAMES;
    }

    DecodedBlock { audio, events }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;

    fn timing(block_time: f64, anchor: f64) -> BlockTiming {
        BlockTiming {
            block_time,
            anchor,
            sample_rate: RATE,
        }
    }

    fn msg(timestamp_ms: i32, note: u8) -> MidiMsg {
        MidiMsg {
            timestamp_ms,
            data: [0x90, note, 100, 0],
        }
    }

    fn ramp(frames: usize) -> Vec<i16> {
        (0..frames).map(|i| (i as i16).wrapping_mul(3)).collect()
    }

    #[test]
    fn no_messages_gives_audio_and_silence() {
        let audio = ramp(16);
        let block = interleave(&audio, &[], &timing(0.0, 0.0));
        assert_eq!(block.samples.len(), 32);
        for (i, frame) in block.samples.chunks(2).enumerate() {
            assert_eq!(frame[0], audio[i]);
            assert_eq!(frame[1], SILENCE);
        }
        assert!(block.slots.is_empty());
    }

    #[test]
    fn message_lands_at_its_sample_offset() {
        // 10 ms into the block at 48 kHz = frame 480 = slot 120
        let audio = ramp(4096);
        let block = interleave(&audio, &[msg(1010, 64)], &timing(1.0, 0.0));
        assert_eq!(block.slots, vec![120]);
        let right: Vec<i16> = block.samples.iter().skip(1).step_by(2).copied().collect();
        assert_eq!(&right[480..484], &[0x90, 64, 100, 0]);
        assert_eq!(right[479], SILENCE);
        assert_eq!(right[484], SILENCE);
    }

    #[test]
    fn colliding_messages_get_distinct_increasing_slots() {
        // (t0 + mt - t) * 48000 / 4 = 5 for all three
        let timestamp_ms = 0;
        let t = -(5.0 * 4.0) / RATE as f64;
        let messages = [msg(timestamp_ms, 60), msg(timestamp_ms, 61), msg(timestamp_ms, 62)];
        for m in &messages {
            assert_eq!(raw_slot(m.time_secs(), &timing(t, 0.0)), 5);
        }

        let block = interleave(&ramp(4096), &messages, &timing(t, 0.0));
        assert_eq!(block.slots, vec![5, 6, 7]);
    }

    #[test]
    fn early_messages_clamp_to_their_index() {
        // Timestamps before the block start
        let messages = [msg(0, 1), msg(0, 2)];
        let block = interleave(&ramp(64), &messages, &timing(5.0, 0.0));
        assert_eq!(block.slots, vec![0, 1]);
    }

    #[test]
    fn late_messages_keep_room_for_followers() {
        // Far past the block end; capacity is 16 slots
        let messages = [msg(60_000, 1), msg(60_000, 2), msg(60_000, 3)];
        let block = interleave(&ramp(64), &messages, &timing(0.0, 0.0));
        assert_eq!(block.slots, vec![13, 14, 15]);
    }

    #[test]
    fn out_of_order_timestamps_stay_increasing() {
        let t = 0.0;
        let messages = [msg(5, 1), msg(1, 2)];
        let block = interleave(&ramp(4096), &messages, &timing(t, 0.0));
        assert_eq!(block.slots, vec![60, 61]);
    }

    #[test]
    fn more_messages_than_slots_fills_every_slot_and_drops_rest() {
        let capacity = slot_capacity(32);
        assert_eq!(capacity, 8);
        let messages: Vec<MidiMsg> = (0..12).map(|i| msg(0, i as u8)).collect();
        let block = interleave(&ramp(32), &messages, &timing(0.0, 0.0));
        assert_eq!(block.slots, (0..8).collect::<Vec<_>>());
        assert_eq!(block.dropped, 4);
        assert_eq!(block.samples.len(), 64);
    }

    #[test]
    fn exactly_capacity_messages_fill_every_slot() {
        let messages: Vec<MidiMsg> = (0..4).map(|i| msg(1000, i as u8)).collect();
        let block = interleave(&ramp(16), &messages, &timing(0.0, 0.0));
        assert_eq!(block.slots, vec![0, 1, 2, 3]);
        assert_eq!(block.dropped, 0);
    }

    #[test]
    fn block_shorter_than_a_slot_drops_all_messages() {
        let block = interleave(&ramp(3), &[msg(0, 1)], &timing(0.0, 0.0));
        assert_eq!(block.dropped, 1);
        assert!(block.samples.iter().skip(1).step_by(2).all(|&v| v == SILENCE));
    }

    #[test]
    fn decode_recovers_audio_and_payloads() {
        let audio: Vec<i16> = (0..4096).map(|i| ((i * 37) % 2000) as i16 - 1000).collect();
        let t = 2.0;
        let messages = [
            MidiMsg { timestamp_ms: 2001, data: [0x90, 60, 90, 0] },
            MidiMsg { timestamp_ms: 2001, data: [0x80, 60, 0, 0] },
            MidiMsg { timestamp_ms: 2050, data: [0xF0, 0x7E, 0x00, 0xF7] },
        ];
        let block = interleave(&audio, &messages, &timing(t, 0.0));
        let decoded = decode(&block.samples);

        assert_eq!(decoded.audio, audio);
        assert_eq!(decoded.events.len(), 3);
        for ((event, slot), message) in decoded.events.iter().zip(&block.slots).zip(&messages) {
            assert_eq!(event.frame, slot * SLOT_FRAMES);
            assert_eq!(event.data, message.data);
        }
        assert_eq!(decoded.events[0].frame, 48);
    }

    #[test]
    fn decode_finds_payloads_across_unaligned_blocks() {
        // Two 6-frame blocks written back to back; the second block's slot 0
        // starts at file frame 6
        let first = interleave(&ramp(6), &[msg(0, 1)], &timing(0.0, 0.0));
        let second = interleave(&ramp(6), &[msg(0, 2)], &timing(0.0, 0.0));
        let mut file = first.samples.clone();
        file.extend_from_slice(&second.samples);

        let decoded = decode(&file);
        let frames: Vec<usize> = decoded.events.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![0, 6]);
        assert_eq!(decoded.events[1].data, [0x90, 2, 100, 0]);
    }

    #[test]
    fn decode_ignores_trailing_odd_sample() {
        let mut samples = interleave(&ramp(4), &[], &timing(0.0, 0.0)).samples;
        samples.push(42);
        let decoded = decode(&samples);
        assert_eq!(decoded.audio.len(), 4);
        assert!(decoded.events.is_empty());
    }

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_slot(-10, 2, 4, 100, None), 2);
        assert_eq!(clamp_slot(1_000, 2, 4, 100, None), 98);
        assert_eq!(clamp_slot(40, 1, 3, 100, Some(45)), 46);
        assert_eq!(clamp_slot(40, 1, 3, 100, Some(10)), 40);
    }
}
