// Take folder management: directory scan, header checks and crash repair

use super::{parse_take_timestamp, TakeInfo, TAKE_EXTENSION};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// ============================================================================
// Header checks and repair
// ============================================================================

/// Location of the interesting parts of a WAV header
struct WavLayout {
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    data_chunk_offset: u64,
}

/// Walk RIFF chunks up to the data chunk.
fn scan_wav_layout(file: &mut std::fs::File) -> anyhow::Result<WavLayout> {
    let file_size = file.metadata()?.len();
    if file_size < 44 {
        return Err(anyhow::anyhow!("File too small to be a valid WAV file"));
    }

    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Err(anyhow::anyhow!("Not a valid WAV file"));
    }

    let mut channels: u16 = 0;
    let mut sample_rate: u32 = 0;
    let mut block_align: u16 = 0;
    let mut data_chunk_offset: u64 = 0;

    let mut pos: u64 = 12;
    loop {
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk_header = [0u8; 8];
        if file.read_exact(&mut chunk_header).is_err() {
            break;
        }

        let chunk_id = &chunk_header[0..4];
        let chunk_size = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]);

        if chunk_id == b"fmt " {
            let mut fmt = [0u8; 16];
            file.read_exact(&mut fmt)?;
            channels = u16::from_le_bytes([fmt[2], fmt[3]]);
            sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
            block_align = u16::from_le_bytes([fmt[12], fmt[13]]);
        } else if chunk_id == b"data" {
            data_chunk_offset = pos;
            break;
        }

        // WAV chunks are 2-byte aligned
        pos += 8 + chunk_size as u64;
        if chunk_size % 2 != 0 {
            pos += 1;
        }
    }

    if data_chunk_offset == 0 || channels == 0 || block_align == 0 {
        return Err(anyhow::anyhow!("Could not find fmt/data chunks"));
    }

    Ok(WavLayout {
        channels,
        sample_rate,
        block_align,
        data_chunk_offset,
    })
}

/// Check if a take has stale RIFF/data sizes (process died mid-take).
pub fn wav_file_needs_repair(file_path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(file_path) else { return false; };
    let Ok(file_size) = file.metadata().map(|m| m.len()) else { return false; };
    let Ok(layout) = scan_wav_layout(&mut file) else { return false; };

    let mut riff = [0u8; 4];
    if file.seek(SeekFrom::Start(4)).is_err() || file.read_exact(&mut riff).is_err() {
        return false;
    }
    let mut data = [0u8; 4];
    if file.seek(SeekFrom::Start(layout.data_chunk_offset + 4)).is_err()
        || file.read_exact(&mut data).is_err()
    {
        return false;
    }

    let stored_riff_size = u32::from_le_bytes(riff) as u64;
    let stored_data_size = u32::from_le_bytes(data) as u64;
    let actual_data_size = file_size - layout.data_chunk_offset - 8;

    stored_riff_size != file_size - 8 || stored_data_size != actual_data_size
}

/// Repair a take by trimming any partial frame and patching the RIFF and
/// data chunk sizes.
pub fn repair_wav_file(file_path: &Path) -> anyhow::Result<TakeInfo> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(file_path)?;
    let layout = scan_wav_layout(&mut file)?;

    let file_size = file.metadata()?.len();
    let data_start = layout.data_chunk_offset + 8;
    let raw_data_size = file_size.saturating_sub(data_start);
    let data_size = raw_data_size - raw_data_size % layout.block_align as u64;
    if data_size != raw_data_size {
        file.set_len(data_start + data_size)?;
    }
    let new_file_size = data_start + data_size;

    file.seek(SeekFrom::Start(4))?;
    file.write_all(&((new_file_size - 8) as u32).to_le_bytes())?;
    file.seek(SeekFrom::Start(layout.data_chunk_offset + 4))?;
    file.write_all(&(data_size as u32).to_le_bytes())?;
    file.flush()?;

    let frames = data_size / layout.block_align as u64;
    let duration_secs = if layout.sample_rate > 0 {
        frames as f64 / layout.sample_rate as f64
    } else {
        0.0
    };

    log::info!(
        "Repaired take: {} ({}Hz, {}ch, {:.1}s)",
        file_path.display(),
        layout.sample_rate,
        layout.channels,
        duration_secs
    );

    Ok(TakeInfo {
        filename: file_name(file_path),
        started_at: parse_take_timestamp(&file_name(file_path)),
        channels: layout.channels,
        sample_rate: layout.sample_rate,
        duration_secs,
        size_bytes: new_file_size,
    })
}

/// Repair every unfinished take in `dir`. Returns the repaired paths.
pub fn recover_unfinished_takes(dir: &Path) -> Vec<PathBuf> {
    let mut repaired = Vec::new();
    for path in take_files(dir) {
        if !wav_file_needs_repair(&path) {
            continue;
        }
        match repair_wav_file(&path) {
            Ok(_) => repaired.push(path),
            Err(e) => log::warn!("Failed to repair take {}: {}", path.display(), e),
        }
    }
    if !repaired.is_empty() {
        log::info!("Recovered {} unfinished take(s) in {}", repaired.len(), dir.display());
    }
    repaired
}

// ============================================================================
// Directory scan
// ============================================================================

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn take_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new(); };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(TAKE_EXTENSION))
        .collect()
}

/// Read a take's format and duration from its header.
pub fn read_take_info(path: &Path) -> anyhow::Result<TakeInfo> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let size_bytes = std::fs::metadata(path)?.len();
    let duration_secs = if spec.sample_rate > 0 {
        reader.duration() as f64 / spec.sample_rate as f64
    } else {
        0.0
    };
    let filename = file_name(path);

    Ok(TakeInfo {
        started_at: parse_take_timestamp(&filename),
        filename,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        duration_secs,
        size_bytes,
    })
}

/// All readable takes in `dir`, oldest first.
pub fn list_takes(dir: &Path) -> Vec<TakeInfo> {
    let mut takes: Vec<TakeInfo> = take_files(dir)
        .iter()
        .filter_map(|path| match read_take_info(path) {
            Ok(info) => Some(info),
            Err(e) => {
                log::debug!("Skipping {}: {}", path.display(), e);
                None
            }
        })
        .collect();
    takes.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    takes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_take(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames * 2 {
            writer.write_sample(i as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    /// Simulate a crash: append frames behind the header's back.
    fn append_unaccounted(path: &Path, bytes: usize) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(&vec![7u8; bytes]).unwrap();
    }

    #[test]
    fn finalized_take_needs_no_repair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01-01_00-00-00.wav");
        write_take(&path, 480);
        assert!(!wav_file_needs_repair(&path));
    }

    #[test]
    fn stale_header_is_detected_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01-01_00-00-00.wav");
        write_take(&path, 480);
        append_unaccounted(&path, 4 * 480 + 3);
        assert!(wav_file_needs_repair(&path));

        let info = repair_wav_file(&path).unwrap();
        assert_eq!(info.channels, 2);
        assert!((info.duration_secs - 0.02).abs() < 1e-9);
        assert!(!wav_file_needs_repair(&path));

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.duration(), 960);
    }

    #[test]
    fn recovery_only_touches_broken_takes() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("2024-01-01_00-00-00.wav");
        let broken = dir.path().join("2024-01-01_00-00-10.wav");
        write_take(&good, 100);
        write_take(&broken, 100);
        append_unaccounted(&broken, 400);
        std::fs::write(dir.path().join("notes.txt"), b"not a take").unwrap();

        let repaired = recover_unfinished_takes(dir.path());
        assert_eq!(repaired, vec![broken]);
    }

    #[test]
    fn garbage_files_are_not_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.wav");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(!wav_file_needs_repair(&path));
        assert!(repair_wav_file(&path).is_err());
    }

    #[test]
    fn takes_are_listed_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_take(&dir.path().join("2024-01-02_00-00-00.wav"), 4800);
        write_take(&dir.path().join("2024-01-01_00-00-00.wav"), 48_000);
        std::fs::write(dir.path().join("broken.wav"), b"nope").unwrap();

        let takes = list_takes(dir.path());
        assert_eq!(takes.len(), 2);
        assert_eq!(takes[0].filename, "2024-01-01_00-00-00.wav");
        assert!((takes[0].duration_secs - 1.0).abs() < 1e-9);
        assert!((takes[1].duration_secs - 0.1).abs() < 1e-9);
        assert_eq!(takes[1].sample_rate, 48_000);
    }
}
