// Input activity detection: block peak amplitude and the idle accumulator

/// Peak amplitude above which a block counts as activity
pub const DEFAULT_TRIGGER_THRESHOLD: u16 = 10;

/// Idle time before any block has been seen. Large enough that no take starts
/// until real activity arrives.
pub const INITIAL_IDLE_SECS: f64 = f64::INFINITY;

/// Maximum absolute sample value in the block, or `None` for an empty block.
///
/// `i16::MIN` yields 32768.
pub fn peak_amplitude(samples: &[i16]) -> Option<u16> {
    samples.iter().map(|s| s.unsigned_abs()).max()
}

/// Seconds since the last block whose peak exceeded the threshold
#[derive(Debug, Clone)]
pub struct IdleTracker {
    threshold: u16,
    idle_secs: f64,
}

impl IdleTracker {
    pub fn new(threshold: u16) -> Self {
        Self {
            threshold,
            idle_secs: INITIAL_IDLE_SECS,
        }
    }

    pub fn idle_secs(&self) -> f64 {
        self.idle_secs
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    /// Fold one block into the accumulator and return the new idle time.
    pub fn update(&mut self, peak: u16, frames: usize, sample_rate: u32) -> f64 {
        if peak > self.threshold {
            self.idle_secs = 0.0;
        } else if sample_rate > 0 {
            self.idle_secs += frames as f64 / sample_rate as f64;
        }
        self.idle_secs
    }

    pub fn reset(&mut self) {
        self.idle_secs = INITIAL_IDLE_SECS;
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRIGGER_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_is_max_absolute_value() {
        assert_eq!(peak_amplitude(&[1, -7, 3]), Some(7));
        assert_eq!(peak_amplitude(&[0, 0, 0]), Some(0));
        assert_eq!(peak_amplitude(&[12]), Some(12));
        assert_eq!(peak_amplitude(&[5, -5]), Some(5));
    }

    #[test]
    fn peak_handles_most_negative_sample() {
        assert_eq!(peak_amplitude(&[i16::MIN, 100]), Some(32768));
        assert_eq!(peak_amplitude(&[i16::MAX]), Some(32767));
    }

    #[test]
    fn empty_block_has_no_peak() {
        assert_eq!(peak_amplitude(&[]), None);
    }

    #[test]
    fn peak_matches_naive_scan() {
        let block: Vec<i16> = (0..4096)
            .map(|i| ((i * 7919) % 65536) as i32 - 32768)
            .map(|v| v as i16)
            .collect();
        let naive = block.iter().map(|&s| (s as i32).abs()).max().unwrap() as u16;
        assert_eq!(peak_amplitude(&block), Some(naive));
    }

    #[test]
    fn idle_starts_far_above_any_threshold() {
        let tracker = IdleTracker::default();
        assert!(tracker.idle_secs() > 1_000.0);
    }

    #[test]
    fn activity_resets_idle() {
        let mut tracker = IdleTracker::new(10);
        assert_eq!(tracker.update(11, 4096, 48_000), 0.0);
    }

    #[test]
    fn threshold_itself_is_not_activity() {
        let mut tracker = IdleTracker::new(10);
        tracker.update(500, 4096, 48_000);
        let idle = tracker.update(10, 4800, 48_000);
        assert!((idle - 0.1).abs() < 1e-12);
    }

    #[test]
    fn idle_is_sum_of_quiet_blocks_since_last_activity() {
        let sample_rate = 44_100;
        let blocks: [(u16, usize); 7] = [
            (3, 4096),
            (900, 4096),
            (2, 1024),
            (0, 4096),
            (10, 512),
            (4, 2048),
            (1, 4096),
        ];

        let mut tracker = IdleTracker::new(10);
        for (peak, frames) in blocks {
            tracker.update(peak, frames, sample_rate);
        }

        let expected: f64 = blocks[2..]
            .iter()
            .map(|&(_, frames)| frames as f64 / sample_rate as f64)
            .sum();
        assert!((tracker.idle_secs() - expected).abs() < 1e-9);
    }

    #[test]
    fn reset_returns_to_initial_idle() {
        let mut tracker = IdleTracker::new(10);
        tracker.update(100, 64, 48_000);
        tracker.reset();
        assert_eq!(tracker.idle_secs(), INITIAL_IDLE_SECS);
    }
}
