// Take output streams: a direct hound WAV sink and a queued sink that hands
// blocks to a dedicated writer thread. The callback only opens files; it never
// writes them or waits on the writer.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{RecordingError, Result};
use crate::session;

/// Output layout of a take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl TakeFormat {
    /// 16-bit stereo: audio left, MIDI right
    pub fn interleaved(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
            bits_per_sample: 16,
        }
    }

    fn wav_spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        }
    }
}

/// An open take. Blocks are appended in order and the file is finalized by
/// `finish`.
pub trait TakeSink: Send {
    fn path(&self) -> &Path;
    fn append(&mut self, samples: Vec<i16>) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;

    /// Push buffered data to disk without closing the take
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates the output stream for each new take
pub trait TakeOpener: Send {
    fn open(&mut self, format: TakeFormat) -> Result<Box<dyn TakeSink>>;
}

// ============================================================================
// Direct WAV sink
// ============================================================================

/// Writes interleaved samples straight to a WAV file via hound
pub struct WavTakeSink {
    writer: hound::WavWriter<BufWriter<File>>,
    path: PathBuf,
    format: TakeFormat,
    samples_written: u64,
}

impl WavTakeSink {
    /// Create the file and write its header
    pub fn create(path: &Path, format: TakeFormat) -> Result<Self> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(RecordingError::InvalidFormat(format!("{:?}", format)));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = hound::WavWriter::create(path, format.wav_spec())?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            format,
            samples_written: 0,
        })
    }

    pub fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        for &sample in samples {
            self.writer.write_sample(sample)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Flush buffered data and rewrite the header sizes so the file is
    /// readable if the process dies before `finalize`.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.samples_written / self.format.channels as u64
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames_written() as f64 / self.format.sample_rate as f64
    }

    pub fn finalize(self) -> Result<PathBuf> {
        let frames = self.frames_written();
        let duration = self.duration_secs();
        self.writer.finalize()?;
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        log::info!(
            "Take finished: {} ({} frames, {:.1}s, {} bytes)",
            self.path.display(),
            frames,
            duration,
            size
        );
        Ok(self.path)
    }
}

impl TakeSink for WavTakeSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, samples: Vec<i16>) -> Result<()> {
        self.write_samples(&samples)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.finalize().map(|_| ())
    }

    fn flush(&mut self) -> Result<()> {
        WavTakeSink::flush(self)
    }
}

// ============================================================================
// Writer thread
// ============================================================================

enum WriterCommand {
    Begin {
        sink: Box<dyn TakeSink>,
        failed: Arc<AtomicBool>,
    },
    Append(Vec<i16>),
    Finish,
}

/// Sending side of the writer queue. Control messages go through
/// unconditionally; appends are bounded by `capacity` pending blocks.
#[derive(Clone)]
struct WriterQueue {
    sender: Sender<WriterCommand>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
    dropped_blocks: Arc<AtomicU64>,
}

impl WriterQueue {
    fn control(&self, command: WriterCommand) -> Result<()> {
        self.sender.send(command).map_err(|_| RecordingError::WriterGone)
    }

    fn append(&self, samples: Vec<i16>) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.capacity {
            let dropped = self.dropped_blocks.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                log::warn!("Writer queue full, {} blocks dropped so far", dropped);
            }
            return Ok(());
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.sender.send(WriterCommand::Append(samples)).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            RecordingError::WriterGone
        })
    }
}

/// Background thread that owns the output stream of the active take
pub struct TakeWriterThread {
    queue: Option<WriterQueue>,
    handle: Option<JoinHandle<()>>,
    dropped_blocks: Arc<AtomicU64>,
}

impl TakeWriterThread {
    /// Spawn the writer with room for `queue_blocks` pending blocks. The
    /// active file is flushed every `flush_interval`.
    pub fn spawn(queue_blocks: usize, flush_interval: Duration) -> anyhow::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let dropped_blocks = Arc::new(AtomicU64::new(0));

        let loop_pending = pending.clone();
        let handle = std::thread::Builder::new()
            .name("autotake-writer".into())
            .spawn(move || writer_loop(receiver, loop_pending, flush_interval))?;

        Ok(Self {
            queue: Some(WriterQueue {
                sender,
                pending,
                capacity: queue_blocks.max(1),
                dropped_blocks: dropped_blocks.clone(),
            }),
            handle: Some(handle),
            dropped_blocks,
        })
    }

    /// Opener that creates WAV takes under `dir` and streams them through
    /// this thread
    pub fn opener(&self, dir: PathBuf) -> Result<QueuedTakeOpener> {
        self.queued(Box::new(DirectTakeOpener::new(dir)))
    }

    /// Opener that creates takes with `inner` and hands them to this thread
    pub fn queued(&self, inner: Box<dyn TakeOpener>) -> Result<QueuedTakeOpener> {
        let queue = self.queue.clone().ok_or(RecordingError::WriterGone)?;
        Ok(QueuedTakeOpener { inner, queue })
    }

    /// Blocks lost to a full queue since startup
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks.load(Ordering::Relaxed)
    }

    /// Wait for the thread to finish the active take and exit. Every opener
    /// must be dropped first or this blocks until they are.
    pub fn join(mut self) {
        self.queue = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Take writer thread panicked");
            }
        }
        let dropped = self.dropped_blocks();
        if dropped > 0 {
            log::warn!("{} audio blocks were dropped because the writer fell behind", dropped);
        }
    }
}

struct ActiveTake {
    sink: Box<dyn TakeSink>,
    failed: Arc<AtomicBool>,
}

fn writer_loop(
    receiver: Receiver<WriterCommand>,
    pending: Arc<AtomicUsize>,
    flush_interval: Duration,
) {
    let mut active: Option<ActiveTake> = None;
    let mut last_flush = Instant::now();

    loop {
        let command = match receiver.recv_timeout(flush_interval) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match command {
            Some(WriterCommand::Begin { sink, failed }) => {
                if let Some(previous) = active.take() {
                    finish_take(previous.sink);
                }
                active = Some(ActiveTake { sink, failed });
                last_flush = Instant::now();
            }
            Some(WriterCommand::Append(samples)) => {
                pending.fetch_sub(1, Ordering::AcqRel);
                if let Some(take) = active.as_mut() {
                    if !take.failed.load(Ordering::Acquire) {
                        if let Err(e) = take.sink.append(samples) {
                            log::warn!("Write failed for {}: {}", take.sink.path().display(), e);
                            take.failed.store(true, Ordering::Release);
                        }
                    }
                }
            }
            Some(WriterCommand::Finish) => {
                if let Some(take) = active.take() {
                    finish_take(take.sink);
                }
            }
            None => {}
        }

        if last_flush.elapsed() >= flush_interval {
            if let Some(take) = active.as_mut() {
                if let Err(e) = take.sink.flush() {
                    log::warn!("Flush failed for {}: {}", take.sink.path().display(), e);
                }
            }
            last_flush = Instant::now();
        }
    }

    if let Some(take) = active.take() {
        finish_take(take.sink);
    }
    log::debug!("Take writer stopped");
}

fn finish_take(sink: Box<dyn TakeSink>) {
    let path = sink.path().to_path_buf();
    if let Err(e) = sink.finish() {
        log::warn!("Failed to finalize {}: {}", path.display(), e);
    }
}

/// Opens takes synchronously and streams their blocks to the writer thread
pub struct QueuedTakeOpener {
    inner: Box<dyn TakeOpener>,
    queue: WriterQueue,
}

impl TakeOpener for QueuedTakeOpener {
    fn open(&mut self, format: TakeFormat) -> Result<Box<dyn TakeSink>> {
        let sink = self.inner.open(format)?;
        let path = sink.path().to_path_buf();
        let failed = Arc::new(AtomicBool::new(false));
        self.queue.control(WriterCommand::Begin {
            sink,
            failed: failed.clone(),
        })?;
        Ok(Box::new(QueuedTakeSink {
            path,
            queue: self.queue.clone(),
            failed,
        }))
    }
}

/// Handle to the take owned by the writer thread
pub struct QueuedTakeSink {
    path: PathBuf,
    queue: WriterQueue,
    failed: Arc<AtomicBool>,
}

impl TakeSink for QueuedTakeSink {
    fn path(&self) -> &Path {
        &self.path
    }

    /// Fails once the writer thread has hit an error on this take
    fn append(&mut self, samples: Vec<i16>) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(RecordingError::WriteFailed(self.path.clone()));
        }
        self.queue.append(samples)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.queue.control(WriterCommand::Finish)
    }
}

/// Opens takes under `dir` and writes them from the calling thread
pub struct DirectTakeOpener {
    dir: PathBuf,
}

impl DirectTakeOpener {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl TakeOpener for DirectTakeOpener {
    fn open(&mut self, format: TakeFormat) -> Result<Box<dyn TakeSink>> {
        let path = session::take_path(&self.dir, chrono::Utc::now());
        Ok(Box::new(WavTakeSink::create(&path, format)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::AudioBlock;
    use crate::recording::{RecordingStatus, TakeMonitor, TakeSettings};

    /// Takes on a full disk: every write fails
    struct FullDiskOpener;

    struct FullDiskSink(PathBuf);

    impl TakeOpener for FullDiskOpener {
        fn open(&mut self, _format: TakeFormat) -> Result<Box<dyn TakeSink>> {
            Ok(Box::new(FullDiskSink(PathBuf::from("full.wav"))))
        }
    }

    impl TakeSink for FullDiskSink {
        fn path(&self) -> &Path {
            &self.0
        }

        fn append(&mut self, _samples: Vec<i16>) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device").into())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    /// Takes whose writes wait until the gate sender is dropped
    struct GatedOpener(Receiver<()>);

    struct GatedSink(PathBuf, Receiver<()>);

    impl TakeOpener for GatedOpener {
        fn open(&mut self, _format: TakeFormat) -> Result<Box<dyn TakeSink>> {
            Ok(Box::new(GatedSink(PathBuf::from("slow.wav"), self.0.clone())))
        }
    }

    impl TakeSink for GatedSink {
        fn path(&self) -> &Path {
            &self.0
        }

        fn append(&mut self, _samples: Vec<i16>) -> Result<()> {
            let _ = self.1.recv();
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    fn read_samples(path: &Path) -> (hound::WavSpec, Vec<i16>) {
        let mut reader = hound::WavReader::open(path).unwrap();
        let spec = reader.spec();
        let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        (spec, samples)
    }

    #[test]
    fn direct_sink_writes_stereo_16_bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut opener = DirectTakeOpener::new(dir.path().to_path_buf());
        let mut sink = opener.open(TakeFormat::interleaved(44_100)).unwrap();
        let path = sink.path().to_path_buf();
        sink.append(vec![1, -1, 2, -1]).unwrap();
        sink.append(vec![3, 0x90]).unwrap();
        sink.finish().unwrap();

        let (spec, samples) = read_samples(&path);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(samples, vec![1, -1, 2, -1, 3, 0x90]);
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = WavTakeSink::create(&dir.path().join("x.wav"), TakeFormat::interleaved(0));
        assert!(matches!(result, Err(RecordingError::InvalidFormat(_))));
    }

    #[test]
    fn open_fails_when_directory_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut opener = DirectTakeOpener::new(blocker.join("takes"));
        assert!(opener.open(TakeFormat::interleaved(48_000)).is_err());
    }

    #[test]
    fn queued_takes_are_written_by_the_thread() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TakeWriterThread::spawn(16, Duration::from_millis(10)).unwrap();
        let mut opener = writer.opener(dir.path().to_path_buf()).unwrap();

        let mut first = opener.open(TakeFormat::interleaved(48_000)).unwrap();
        let first_path = first.path().to_path_buf();
        first.append(vec![10, -1, 20, -1]).unwrap();
        first.finish().unwrap();

        let mut second = opener.open(TakeFormat::interleaved(48_000)).unwrap();
        let second_path = second.path().to_path_buf();
        assert_ne!(first_path, second_path);
        second.append(vec![5, 6]).unwrap();
        // Left open: the thread finalizes it on shutdown

        drop(second);
        drop(opener);
        writer.join();

        assert_eq!(read_samples(&first_path).1, vec![10, -1, 20, -1]);
        assert_eq!(read_samples(&second_path).1, vec![5, 6]);
    }

    #[test]
    fn periodic_flush_keeps_open_take_readable() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TakeWriterThread::spawn(16, Duration::from_millis(5)).unwrap();
        let mut opener = writer.opener(dir.path().to_path_buf()).unwrap();
        let mut sink = opener.open(TakeFormat::interleaved(8_000)).unwrap();
        sink.append(vec![1; 800]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut frames = 0;
        while Instant::now() < deadline {
            if let Ok(reader) = hound::WavReader::open(sink.path()) {
                frames = reader.duration();
                if frames == 400 {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(frames, 400);
        assert!(!session::wav_file_needs_repair(sink.path()));

        sink.finish().unwrap();
        drop(opener);
        writer.join();
    }

    #[test]
    fn writer_failure_ends_the_take() {
        let writer = TakeWriterThread::spawn(16, Duration::from_millis(10)).unwrap();
        let opener = writer.queued(Box::new(FullDiskOpener)).unwrap();
        let mut monitor = TakeMonitor::new(TakeSettings::default(), Box::new(opener));
        monitor.set_sample_rate(1000);

        let loud: &[i16] = &[1000; 10];
        let block = |t: f64| AudioBlock { samples: loud, hw_time: t };
        assert_eq!(monitor.process_block(&block(0.0), &[]), RecordingStatus::Recording);

        // The failure surfaces on the first append after the thread hits it
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut status = RecordingStatus::Recording;
        let mut t = 0.0;
        while monitor.stats().write_failures == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            t += 0.001;
            status = monitor.process_block(&block(t), &[]);
        }
        assert_eq!(monitor.stats().write_failures, 1);
        assert_eq!(status, RecordingStatus::Idle);
        assert!(monitor.current_take().is_none());

        // A fresh take starts with a clean slate
        t += 0.001;
        assert_eq!(monitor.process_block(&block(t), &[]), RecordingStatus::Recording);
        assert_eq!(monitor.stats().takes_started, 2);

        drop(monitor);
        writer.join();
    }

    #[test]
    fn stalled_writer_drops_blocks_but_accepts_control() {
        let (gate, gate_rx) = crossbeam_channel::unbounded::<()>();
        let writer = TakeWriterThread::spawn(2, Duration::from_millis(10)).unwrap();
        let mut opener = writer.queued(Box::new(GatedOpener(gate_rx))).unwrap();

        let mut sink = opener.open(TakeFormat::interleaved(1000)).unwrap();
        for _ in 0..10 {
            sink.append(vec![0; 4]).unwrap();
        }
        // One block held by the writer, two queued
        assert!(writer.dropped_blocks() >= 7);

        sink.finish().unwrap();
        let next = opener.open(TakeFormat::interleaved(1000)).unwrap();
        next.finish().unwrap();

        drop(gate);
        drop(opener);
        writer.join();
    }
}
