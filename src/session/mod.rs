// Take naming and on-disk take management

pub mod storage;

pub use storage::*;

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

/// File extension of recorded takes
pub const TAKE_EXTENSION: &str = "wav";

const TAKE_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Summary of one take file on disk
#[derive(Debug, Clone, Serialize)]
pub struct TakeInfo {
    pub filename: String,
    pub started_at: Option<DateTime<Utc>>,
    pub channels: u16,
    pub sample_rate: u32,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

/// Path for a take starting at `started_at`, e.g. "2026-02-21_14-32-45.wav".
/// A "_2", "_3", ... suffix is added if that name is already taken.
pub fn take_path(dir: &Path, started_at: DateTime<Utc>) -> PathBuf {
    let stem = started_at.format(TAKE_TIME_FORMAT).to_string();
    let first = dir.join(format!("{}.{}", stem, TAKE_EXTENSION));
    if !first.exists() {
        return first;
    }
    (2..)
        .map(|n| dir.join(format!("{}_{}.{}", stem, n, TAKE_EXTENSION)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Parse the capture start time back out of a take filename
pub fn parse_take_timestamp(filename: &str) -> Option<DateTime<Utc>> {
    let stem = filename.strip_suffix(&format!(".{}", TAKE_EXTENSION))?;
    // 19 chars of timestamp, optionally followed by a collision suffix
    let stamp = stem.get(..19)?;
    NaiveDateTime::parse_from_str(stamp, TAKE_TIME_FORMAT)
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}
