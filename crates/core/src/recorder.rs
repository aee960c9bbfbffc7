//! Diagnostic capture of the near-end, far-end and output streams to WAV.
//!
//! The capture thread never touches the disk: it copies each processed frame
//! of all three streams into one block and `try_send`s it to a writer thread.
//! A full channel drops the whole block, so the files stay sample-aligned. A
//! write failure ends the session's writing without affecting audio
//! processing.

use crate::constants::{FRAME_SIZE, SAMPLE_RATE};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

// ~2s of frames
const CHANNEL_BLOCKS: usize = 200;

/// One frame of mic, reference and output, trimmed to the shortest.
struct Block {
    len: usize,
    mic: [i16; FRAME_SIZE],
    reference: [i16; FRAME_SIZE],
    out: [i16; FRAME_SIZE],
}

impl Block {
    fn new(mic: &[i16], reference: &[i16], out: &[i16]) -> Self {
        let len = mic.len().min(reference.len()).min(out.len()).min(FRAME_SIZE);
        let mut block = Self {
            len,
            mic: [0; FRAME_SIZE],
            reference: [0; FRAME_SIZE],
            out: [0; FRAME_SIZE],
        };
        block.mic[..len].copy_from_slice(&mic[..len]);
        block.reference[..len].copy_from_slice(&reference[..len]);
        block.out[..len].copy_from_slice(&out[..len]);
        block
    }
}

/// Paths of one recording session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingPaths {
    pub mic: PathBuf,
    pub reference: PathBuf,
    pub output: PathBuf,
}

impl RecordingPaths {
    fn new(dir: &Path, timestamp: &str) -> Self {
        Self {
            mic: dir.join(format!("aec_mic_{}.wav", timestamp)),
            reference: dir.join(format!("aec_ref_{}.wav", timestamp)),
            output: dir.join(format!("aec_out_{}.wav", timestamp)),
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.mic, &self.reference, &self.output]
    }
}

/// Samples written per stream, reported when a session stops. Each dropped
/// block is one frame missing from all three files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    pub mic_samples: u64,
    pub ref_samples: u64,
    pub out_samples: u64,
    pub dropped_blocks: u64,
    pub write_failed: bool,
}

struct Session {
    tx: Sender<Block>,
    handle: JoinHandle<RecordingSummary>,
    paths: RecordingPaths,
    failed: Arc<AtomicBool>,
}

pub struct DiagnosticRecorder {
    dir: Mutex<PathBuf>,
    enabled: AtomicBool,
    recording: AtomicBool,
    session: Mutex<Option<Session>>,
    dropped_blocks: AtomicU64,
}

impl Default for DiagnosticRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn wav_spec() -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

impl DiagnosticRecorder {
    pub fn new() -> Self {
        Self {
            dir: Mutex::new(std::env::temp_dir()),
            enabled: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            session: Mutex::new(None),
            dropped_blocks: AtomicU64::new(0),
        }
    }

    pub fn set_dir(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        info!("AEC recording directory: {}", dir.display());
        *self.dir.lock() = dir;
    }

    pub fn dir(&self) -> PathBuf {
        self.dir.lock().clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        info!("AEC recording {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks.load(Ordering::Relaxed)
    }

    /// Opens the three WAV files and starts the writer thread. Returns the
    /// existing paths if a session is already running.
    pub fn start(&self) -> Result<RecordingPaths> {
        if !self.is_enabled() {
            bail!("recording is not enabled");
        }

        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            return Ok(session.paths.clone());
        }

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let paths = RecordingPaths::new(&self.dir(), &timestamp);

        let mut writers = Vec::with_capacity(3);
        for path in paths.all() {
            match WavWriter::create(path, wav_spec())
                .with_context(|| format!("Failed to create {}", path.display()))
            {
                Ok(w) => writers.push(w),
                Err(e) => {
                    drop(writers);
                    for p in paths.all() {
                        let _ = std::fs::remove_file(p);
                    }
                    return Err(e);
                }
            }
        }
        let out = writers.pop();
        let reference = writers.pop();
        let mic = writers.pop();
        let (Some(mic), Some(reference), Some(out)) = (mic, reference, out) else {
            bail!("recorder writers missing");
        };

        self.launch(&mut slot, paths, [mic, reference, out])
    }

    /// Starts a session writing to caller-supplied sinks instead of files.
    #[cfg(test)]
    pub(crate) fn start_with_writers<W>(&self, sinks: [W; 3]) -> Result<RecordingPaths>
    where
        W: Write + Seek + Send + 'static,
    {
        if !self.is_enabled() {
            bail!("recording is not enabled");
        }
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            return Ok(session.paths.clone());
        }
        let paths = RecordingPaths::new(&self.dir(), "test");
        let [mic, reference, out] = sinks;
        let writers = [
            WavWriter::new(mic, wav_spec())?,
            WavWriter::new(reference, wav_spec())?,
            WavWriter::new(out, wav_spec())?,
        ];
        self.launch(&mut slot, paths, writers)
    }

    fn launch<W>(
        &self,
        slot: &mut Option<Session>,
        paths: RecordingPaths,
        writers: [WavWriter<W>; 3],
    ) -> Result<RecordingPaths>
    where
        W: Write + Seek + Send + 'static,
    {
        let (tx, rx) = bounded::<Block>(CHANNEL_BLOCKS);
        let failed = Arc::new(AtomicBool::new(false));
        let writer_failed = Arc::clone(&failed);
        let handle = thread::Builder::new()
            .name("aec-recorder".into())
            .spawn(move || write_loop(rx, writers, writer_failed))
            .context("Failed to spawn recorder thread")?;

        self.dropped_blocks.store(0, Ordering::Relaxed);
        info!(
            "AEC recording started: {}, {}, {}",
            paths.mic.display(),
            paths.reference.display(),
            paths.output.display()
        );
        *slot = Some(Session {
            tx,
            handle,
            paths: paths.clone(),
            failed,
        });
        self.recording.store(true, Ordering::Release);
        Ok(paths)
    }

    /// Queues one processed frame of all three streams. Never blocks.
    pub fn record(&self, mic: &[i16], reference: &[i16], out: &[i16]) {
        if !self.is_recording() {
            return;
        }
        let slot = self.session.lock();
        let Some(session) = slot.as_ref() else {
            return;
        };
        if session.failed.load(Ordering::Relaxed) {
            return;
        }

        match session.tx.try_send(Block::new(mic, reference, out)) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_blocks.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!("AEC recording: writer behind, dropped {} blocks", dropped);
                }
            }
        }
    }

    /// Closes the channel, joins the writer and finalizes the WAV headers.
    pub fn stop(&self) -> Option<RecordingSummary> {
        let session = self.session.lock().take()?;
        self.recording.store(false, Ordering::Release);

        drop(session.tx);
        let mut summary = match session.handle.join() {
            Ok(summary) => summary,
            Err(_) => {
                error!("AEC recording: writer thread panicked");
                RecordingSummary {
                    write_failed: true,
                    ..RecordingSummary::default()
                }
            }
        };
        summary.dropped_blocks = self.dropped_blocks();

        let secs = |n: u64| n as f64 / SAMPLE_RATE as f64;
        info!(
            "AEC recording stopped: mic {:.2}s, ref {:.2}s, out {:.2}s (dropped blocks: {})",
            secs(summary.mic_samples),
            secs(summary.ref_samples),
            secs(summary.out_samples),
            summary.dropped_blocks
        );
        Some(summary)
    }
}

impl Drop for DiagnosticRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_samples<W: Write + Seek>(writer: &mut WavWriter<W>, samples: &[i16]) -> hound::Result<()> {
    for s in samples {
        writer.write_sample(*s)?;
    }
    Ok(())
}

fn write_loop<W: Write + Seek>(
    rx: Receiver<Block>,
    writers: [WavWriter<W>; 3],
    failed: Arc<AtomicBool>,
) -> RecordingSummary {
    let [mut mic, mut reference, mut out] = writers;
    let mut summary = RecordingSummary::default();

    for block in rx.iter() {
        if summary.write_failed {
            // Drain until the session is closed
            continue;
        }
        let len = block.len;
        let written = write_samples(&mut mic, &block.mic[..len])
            .map(|()| summary.mic_samples += len as u64)
            .and_then(|()| write_samples(&mut reference, &block.reference[..len]))
            .map(|()| summary.ref_samples += len as u64)
            .and_then(|()| write_samples(&mut out, &block.out[..len]))
            .map(|()| summary.out_samples += len as u64);
        if let Err(e) = written {
            error!("AEC recording: write failed, recording disabled for this session: {}", e);
            summary.write_failed = true;
            failed.store(true, Ordering::Relaxed);
        }
    }

    for (name, writer) in [("mic", mic), ("ref", reference), ("out", out)] {
        if let Err(e) = writer.finalize() {
            error!("AEC recording: failed to finalize {} file: {}", name, e);
            summary.write_failed = true;
        }
    }
    summary
}

/// In-memory sink that refuses writes past `limit` bytes, like a full disk.
#[cfg(test)]
pub(crate) struct FailingSink {
    inner: std::io::Cursor<Vec<u8>>,
    limit: u64,
}

#[cfg(test)]
impl FailingSink {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            inner: std::io::Cursor::new(Vec::new()),
            limit,
        }
    }
}

#[cfg(test)]
impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.inner.position() + buf.len() as u64 > self.limit {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Seek for FailingSink {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}
