//! The shared echo cancellation subsystem.
//!
//! One [`AecProcessor`] is built at startup and shared as `Arc` between the
//! playback thread (`add_reference*`), the capture thread (`process`) and a
//! control thread (`reset`, `signal_playback_stop`, recording, calibration).
//!
//! Two locks:
//! * bookkeeping: frame store + telemetry counters, held for a few copies;
//! * processing: the engine slot, held for one engine call plus post-filters.
//!
//! `process` takes them one at a time and never nests them. `reset` takes
//! processing then bookkeeping and is the only place both are held.

use crate::calibration::{CalibrationError, CalibrationResult, DelayCalibrator, MAX_DELAY_LIMIT_MS};
use crate::clock::{Clock, MonotonicClock};
use crate::config::AecConfig;
use crate::constants::{FRAME_SIZE, MAX_SAMPLES};
use crate::discard::DiscardSequence;
use crate::echo_cancel::{Aec3Engine, EchoEngine, EngineMetrics};
use crate::error::{AecError, EngineError};
use crate::health::HealthMonitor;
use crate::post_filter::{build_post_filters, HighPassFilter, PostFilter};
use crate::recorder::{DiagnosticRecorder, RecordingPaths, RecordingSummary};
use crate::store::{build_store, FrameStore, ReferenceFrame};
use crate::telemetry::{AecStats, Counters};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

const STATS_LOG_INTERVAL: u64 = 500;
const MIN_DELAY_HINT_MS: u32 = 10;
const MAX_DELAY_HINT_MS: u32 = 200;

struct Bookkeeping {
    store: Box<dyn FrameStore>,
    counters: Counters,
    log_counter: u64,
}

struct EngineSlot {
    engine: Option<Box<dyn EchoEngine>>,
    high_pass: Option<HighPassFilter>,
    post_filters: Vec<Box<dyn PostFilter>>,
}

enum FrameOutcome {
    Cancelled,
    Failed(EngineError),
    // Engine closed while the frame was in flight
    Closed,
}

pub struct AecProcessor {
    config: AecConfig,
    clock: Arc<dyn Clock>,
    book: Mutex<Bookkeeping>,
    slot: Mutex<EngineSlot>,
    has_engine: AtomicBool,
    health: HealthMonitor,
    discard: DiscardSequence,
    recorder: DiagnosticRecorder,
    calibrator: Option<DelayCalibrator>,
    acoustic_delay_ms: AtomicU32,
}

impl AecProcessor {
    /// `engine = None` builds a subsystem that passes audio through forever.
    pub fn new(config: AecConfig, engine: Option<Box<dyn EchoEngine>>) -> Self {
        Self::with_clock(config, engine, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: AecConfig,
        engine: Option<Box<dyn EchoEngine>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.validated();

        let has_engine = engine.is_some();
        if !has_engine {
            log::warn!("AEC engine unavailable, audio will pass through unprocessed");
        }

        let high_pass = if config.enable_high_pass_filter {
            match HighPassFilter::new() {
                Ok(hp) => Some(hp),
                Err(e) => {
                    log::warn!("AEC: high-pass filter disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let calibrator = match DelayCalibrator::new(MAX_DELAY_LIMIT_MS) {
            Ok(cal) => Some(cal),
            Err(e) => {
                log::warn!("AEC calibration unavailable: {}", e);
                None
            }
        };

        log::info!(
            "AEC initialized: policy={:?}, buffer={}ms, delay hint={}ms, high-pass={}, max errors={}",
            config.sync_policy,
            config.ref_buffer_ms,
            config.acoustic_delay_ms,
            high_pass.is_some(),
            config.max_consecutive_errors
        );

        Self {
            book: Mutex::new(Bookkeeping {
                store: build_store(&config),
                counters: Counters::default(),
                log_counter: 0,
            }),
            slot: Mutex::new(EngineSlot {
                high_pass,
                post_filters: build_post_filters(&config),
                engine,
            }),
            has_engine: AtomicBool::new(has_engine),
            health: HealthMonitor::new(config.max_consecutive_errors),
            discard: DiscardSequence::new(),
            recorder: DiagnosticRecorder::new(),
            calibrator,
            acoustic_delay_ms: AtomicU32::new(config.acoustic_delay_ms),
            clock,
            config,
        }
    }

    /// Builds the subsystem around the AEC3 engine, falling back to
    /// pass-through if it cannot be created.
    pub fn with_aec3(config: AecConfig) -> Self {
        let engine: Option<Box<dyn EchoEngine>> = match Aec3Engine::new() {
            Ok(engine) => Some(Box::new(engine)),
            Err(e) => {
                log::error!("Failed to create AEC3 engine: {}", e);
                None
            }
        };
        Self::new(config, engine)
    }

    pub fn config(&self) -> &AecConfig {
        &self.config
    }

    // ---- playback side ----

    /// Queues reference audio using the current acoustic delay hint.
    pub fn add_reference(&self, samples: &[i16]) {
        let delay_us = self.acoustic_delay_ms() as u64 * 1000;
        self.add_reference_with_delay(samples, delay_us);
    }

    /// Queues reference audio that will reach the speaker `delay_us` from now.
    pub fn add_reference_with_delay(&self, samples: &[i16], delay_us: u64) {
        if samples.is_empty() || !self.is_enabled() {
            return;
        }
        if let Some(cal) = &self.calibrator {
            cal.add_reference(samples);
        }
        let now = self.clock.now_us();
        self.book.lock().store.write(samples, now, delay_us);
    }

    /// Opens a playback session explicitly. Writes open one implicitly too.
    pub fn signal_playback_start(&self, delay_us: u64) {
        let now = self.clock.now_us();
        self.book.lock().store.start_session(now, delay_us);
    }

    /// Ends the playback session and invalidates in-flight playback audio.
    pub fn signal_playback_stop(&self) {
        let now = self.clock.now_us();
        self.book.lock().store.stop_session(now);
        self.discard.discard();
    }

    pub fn discard_sequence(&self) -> &DiscardSequence {
        &self.discard
    }

    // ---- capture side ----

    /// Echo-cancels `mic_in` into `out` in 10ms frames.
    ///
    /// `out` always receives `mic_in.len()` samples: cancelled audio, or the
    /// unmodified input for frames that could not be processed.
    pub fn process(&self, mic_in: &[i16], out: &mut [i16]) -> Result<(), AecError> {
        if out.len() != mic_in.len() {
            log::error!(
                "AEC: output length {} != input length {}",
                out.len(),
                mic_in.len()
            );
            out.fill(0);
            return Err(AecError::LengthMismatch {
                input: mic_in.len(),
                output: out.len(),
            });
        }
        if mic_in.len() > MAX_SAMPLES {
            log::error!("AEC input too large: {} > {}", mic_in.len(), MAX_SAMPLES);
            out.fill(0);
            return Err(AecError::TooManySamples {
                len: mic_in.len(),
                max: MAX_SAMPLES,
            });
        }
        if mic_in.is_empty() {
            return Ok(());
        }

        if let Some(cal) = &self.calibrator {
            cal.add_mic(mic_in);
        }

        if !self.is_enabled() {
            out.copy_from_slice(mic_in);
            return Ok(());
        }

        let started = Instant::now();
        for (mic_chunk, out_chunk) in mic_in.chunks(FRAME_SIZE).zip(out.chunks_mut(FRAME_SIZE)) {
            // Disabled part-way through the call: the rest passes through
            if !self.health.is_active() {
                out_chunk.copy_from_slice(mic_chunk);
                continue;
            }
            self.process_frame(mic_chunk, out_chunk);
        }

        let elapsed_us = started.elapsed().as_secs_f32() * 1_000_000.0;
        self.book.lock().counters.record_processing_time(elapsed_us);
        Ok(())
    }

    fn process_frame(&self, mic_chunk: &[i16], out_chunk: &mut [i16]) {
        let n = mic_chunk.len();
        let mut mic_frame = [0i16; FRAME_SIZE];
        mic_frame[..n].copy_from_slice(mic_chunk);

        let now = self.clock.now_us();
        let reference = self.book.lock().store.try_read_frame(now);
        let has_reference = reference.is_some();
        // Cancelling against silence is the degrade path for a missing reference
        let reference = reference.unwrap_or_else(ReferenceFrame::silent);

        let mut cancelled = [0i16; FRAME_SIZE];
        let (outcome, metrics) = {
            let mut guard = self.slot.lock();
            let slot = &mut *guard;
            match slot.engine.as_mut() {
                None => (FrameOutcome::Closed, EngineMetrics::default()),
                Some(engine) => {
                    if let Some(hp) = slot.high_pass.as_mut() {
                        hp.process(&mut mic_frame);
                    }
                    let outcome = match engine.cancel(&mic_frame, &reference.samples, &mut cancelled) {
                        Ok(()) => {
                            for filter in slot.post_filters.iter_mut() {
                                filter.process(&mut cancelled);
                            }
                            FrameOutcome::Cancelled
                        }
                        Err(e) => FrameOutcome::Failed(e),
                    };
                    (outcome, engine.metrics())
                }
            }
        };

        let cancelled_ok = match outcome {
            FrameOutcome::Cancelled => {
                out_chunk.copy_from_slice(&cancelled[..n]);
                self.health.record_success();
                true
            }
            FrameOutcome::Failed(e) => {
                out_chunk.copy_from_slice(mic_chunk);
                self.health.record_failure(&e);
                false
            }
            FrameOutcome::Closed => {
                out_chunk.copy_from_slice(mic_chunk);
                false
            }
        };

        {
            let mut book = self.book.lock();
            if cancelled_ok {
                book.counters.frames_processed += 1;
            }
            if !has_reference {
                book.counters.frames_passed_through += 1;
            }
            book.counters.metrics = metrics;

            book.log_counter += 1;
            if book.log_counter % STATS_LOG_INTERVAL == 0 {
                log_frame_stats(&book, mic_chunk, &reference.samples[..n], out_chunk);
            }
        }

        self.recorder.record(mic_chunk, &reference.samples[..n], out_chunk);
    }

    // ---- health / telemetry ----

    pub fn is_enabled(&self) -> bool {
        self.has_engine.load(Ordering::Acquire) && self.health.is_active()
    }

    pub fn get_stats(&self) -> AecStats {
        let book = self.book.lock();
        let store = book.store.stats();
        book.counters.snapshot(
            &store,
            book.store.estimated_delay_ms(),
            self.health.consecutive_errors(),
            self.is_enabled(),
        )
    }

    pub fn get_erle(&self) -> Option<f32> {
        self.book.lock().counters.metrics.erle_db
    }

    pub fn get_residual_echo_likelihood(&self) -> Option<f32> {
        self.book.lock().counters.metrics.residual_echo_likelihood
    }

    /// Re-enables processing and drops every piece of buffered state.
    pub fn reset(&self) {
        {
            let mut guard = self.slot.lock();
            let mut book = self.book.lock();

            book.store.clear();
            book.counters = Counters::default();
            book.log_counter = 0;

            let slot = &mut *guard;
            if let Some(engine) = slot.engine.as_mut() {
                if let Err(e) = engine.reset() {
                    log::warn!("AEC: engine reset failed, keeping current state: {}", e);
                }
            }
            if let Some(hp) = slot.high_pass.as_mut() {
                hp.reset();
            }
            for filter in slot.post_filters.iter_mut() {
                filter.reset();
            }
        }

        self.health.reset();
        self.discard.discard();
        log::info!("AEC reset");
    }

    /// Drops the engine. Processing passes through from here on.
    pub fn close(&self) {
        let engine = self.slot.lock().engine.take();
        self.has_engine.store(false, Ordering::Release);
        self.recorder.stop();
        if engine.is_some() {
            log::info!("AEC closed");
        }
    }

    // ---- delay hint / calibration ----

    pub fn acoustic_delay_ms(&self) -> u32 {
        self.acoustic_delay_ms.load(Ordering::Relaxed)
    }

    /// Sets the delay hint used by [`add_reference`](Self::add_reference),
    /// clamped to 10..=200ms.
    pub fn set_acoustic_delay_ms(&self, delay_ms: u32) -> u32 {
        let clamped = delay_ms.clamp(MIN_DELAY_HINT_MS, MAX_DELAY_HINT_MS);
        if clamped != delay_ms {
            log::warn!("AEC delay hint {}ms out of range, using {}ms", delay_ms, clamped);
        }
        self.acoustic_delay_ms.store(clamped, Ordering::Relaxed);
        clamped
    }

    pub fn request_calibration(&self) {
        if let Some(cal) = &self.calibrator {
            cal.request();
        }
    }

    pub fn take_calibration_request(&self) -> bool {
        self.calibrator.as_ref().is_some_and(|cal| cal.take_request())
    }

    pub fn start_calibration(&self) {
        if let Some(cal) = &self.calibrator {
            cal.start();
        }
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrator.as_ref().is_some_and(|cal| cal.is_active())
    }

    /// Analyzes the captured calibration audio. On success the measured delay
    /// becomes the new acoustic delay hint.
    pub fn finish_calibration(&self) -> Result<CalibrationResult, CalibrationError> {
        let cal = self.calibrator.as_ref().ok_or(CalibrationError::NotActive)?;
        let result = cal.finish()?;
        let hint = self.set_acoustic_delay_ms(result.delay_ms);
        log::info!("AEC delay hint updated to {}ms", hint);
        Ok(result)
    }

    // ---- diagnostic recording ----

    pub fn set_recording_dir(&self, dir: impl Into<PathBuf>) {
        self.recorder.set_dir(dir);
    }

    pub fn enable_recording(&self, enabled: bool) {
        self.recorder.set_enabled(enabled);
    }

    pub fn start_recording(&self) -> anyhow::Result<RecordingPaths> {
        self.recorder.start()
    }

    pub fn stop_recording(&self) -> Option<RecordingSummary> {
        self.recorder.stop()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }
}

fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: i64 = samples.iter().map(|s| *s as i64 * *s as i64).sum();
    (sum as f64 / samples.len() as f64).sqrt()
}

fn log_frame_stats(book: &Bookkeeping, mic: &[i16], reference: &[i16], out: &[i16]) {
    let (in_rms, ref_rms, out_rms) = (rms(mic), rms(reference), rms(out));
    let attenuation_db = if in_rms > 10.0 && ref_rms > 10.0 {
        20.0 * (out_rms.max(1e-3) / in_rms).log10()
    } else {
        0.0
    };
    let store = book.store.stats();
    let erle = book
        .counters
        .metrics
        .erle_db
        .map_or_else(|| "n/a".to_string(), |e| format!("{:.1}dB", e));

    log::info!(
        "AEC: ERLE={} delay={}ms atten={:.1}dB queued={} matched={} under={} over={} drift={:.0}us mic={:.0} ref={:.0} out={:.0} avg={:.0}us",
        erle,
        book.store.estimated_delay_ms(),
        attenuation_db,
        store.queued_frames,
        store.frames_matched,
        store.underflows,
        store.overflows,
        store.avg_drift_us,
        in_rms,
        ref_rms,
        out_rms,
        book.counters.avg_processing_time_us
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SyncPolicy;
    use crate::constants::SAMPLE_RATE;
    use crate::recorder::FailingSink;

    /// Subtracts the reference from the mic: perfect cancellation of a
    /// sample-aligned echo.
    struct SubtractEngine {
        erle: Option<f32>,
    }

    impl EchoEngine for SubtractEngine {
        fn cancel(
            &mut self,
            mic: &[i16; FRAME_SIZE],
            reference: &[i16; FRAME_SIZE],
            out: &mut [i16; FRAME_SIZE],
        ) -> Result<(), EngineError> {
            for i in 0..FRAME_SIZE {
                out[i] = mic[i].saturating_sub(reference[i]);
            }
            Ok(())
        }

        fn metrics(&self) -> EngineMetrics {
            EngineMetrics {
                erle_db: self.erle,
                residual_echo_likelihood: None,
            }
        }

        fn reset(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct FailingEngine;

    impl EchoEngine for FailingEngine {
        fn cancel(
            &mut self,
            _mic: &[i16; FRAME_SIZE],
            _reference: &[i16; FRAME_SIZE],
            out: &mut [i16; FRAME_SIZE],
        ) -> Result<(), EngineError> {
            out.fill(i16::MAX);
            Err(EngineError::Processing("scripted failure".into()))
        }

        fn reset(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn fifo_config() -> AecConfig {
        AecConfig {
            sync_policy: SyncPolicy::FillLevel,
            enable_high_pass_filter: false,
            ..AecConfig::default()
        }
    }

    fn subtracting(config: AecConfig) -> AecProcessor {
        AecProcessor::new(config, Some(Box::new(SubtractEngine { erle: None })))
    }

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| ((i % 2000) as i16) - 1000).collect()
    }

    #[test]
    fn test_no_engine_is_pure_pass_through() {
        let aec = AecProcessor::new(fifo_config(), None);
        assert!(!aec.is_enabled());

        let mic = ramp(1234);
        let mut out = vec![0i16; mic.len()];
        aec.process(&mic, &mut out).unwrap();
        assert_eq!(out, mic);
    }

    #[test]
    fn test_length_mismatch_zero_fills() {
        let aec = subtracting(fifo_config());
        let mut out = vec![7i16; 100];
        let err = aec.process(&[1i16; 120], &mut out).unwrap_err();
        assert_eq!(err, AecError::LengthMismatch { input: 120, output: 100 });
        assert!(out.iter().all(|s| *s == 0));
    }

    #[test]
    fn test_oversized_input_rejected() {
        let aec = subtracting(fifo_config());
        let mic = vec![1i16; MAX_SAMPLES + 1];
        let mut out = vec![7i16; MAX_SAMPLES + 1];
        let err = aec.process(&mic, &mut out).unwrap_err();
        assert_eq!(
            err,
            AecError::TooManySamples {
                len: MAX_SAMPLES + 1,
                max: MAX_SAMPLES
            }
        );
        assert!(out.iter().all(|s| *s == 0));
    }

    #[test]
    fn test_output_length_matches_partial_frames() {
        let aec = subtracting(fifo_config());
        for len in [1, 479, 480, 481, 1000, MAX_SAMPLES] {
            let mic = ramp(len);
            let mut out = vec![0i16; len];
            aec.process(&mic, &mut out).unwrap();
            // No reference: cancelling against silence leaves the mic intact
            assert_eq!(out, mic, "len {}", len);
        }
    }

    #[test]
    fn test_silent_reference_substitution_is_not_underflow() {
        let aec = subtracting(fifo_config());
        let mic = ramp(FRAME_SIZE * 3);
        let mut out = vec![0i16; mic.len()];
        aec.process(&mic, &mut out).unwrap();

        let stats = aec.get_stats();
        assert_eq!(stats.underflows, 0);
        assert_eq!(stats.frames_passed_through, 3);
        assert_eq!(stats.frames_processed, 3);
        assert!(!stats.playback_active);
    }

    #[test]
    fn test_disables_after_threshold_and_reset_recovers() {
        let config = AecConfig {
            max_consecutive_errors: 10,
            ..fifo_config()
        };
        let aec = AecProcessor::new(config, Some(Box::new(FailingEngine)));

        let mic = ramp(FRAME_SIZE * 9);
        let mut out = vec![0i16; mic.len()];
        aec.process(&mic, &mut out).unwrap();
        assert!(aec.is_enabled());
        assert_eq!(out, mic);

        aec.process(&mic[..FRAME_SIZE], &mut out[..FRAME_SIZE]).unwrap();
        assert!(!aec.is_enabled());
        assert_eq!(aec.get_stats().consecutive_errors, 10);

        // Disabled: unconditional pass-through
        aec.process(&mic, &mut out).unwrap();
        assert_eq!(out, mic);
        assert_eq!(aec.get_stats().consecutive_errors, 10);

        aec.reset();
        assert!(aec.is_enabled());
        assert_eq!(aec.get_stats().consecutive_errors, 0);
    }

    #[test]
    fn test_rest_of_call_passes_through_once_disabled() {
        let config = AecConfig {
            max_consecutive_errors: 3,
            ..fifo_config()
        };
        let aec = AecProcessor::new(config, Some(Box::new(FailingEngine)));
        let mic = ramp(FRAME_SIZE * 6);
        let mut out = vec![0i16; mic.len()];
        aec.process(&mic, &mut out).unwrap();

        assert_eq!(out, mic);
        assert!(!aec.is_enabled());
        assert_eq!(aec.get_stats().consecutive_errors, 3);
    }

    #[test]
    fn test_end_to_end_burst_fifo() {
        let aec = subtracting(fifo_config());

        // 500ms TTS burst, written at once
        let reference = vec![8000i16; SAMPLE_RATE as usize / 2];
        aec.add_reference(&reference);

        let mut out = [0i16; FRAME_SIZE];
        for frame in reference.chunks(FRAME_SIZE) {
            // Mic hears only the echo
            aec.process(frame, &mut out).unwrap();
            assert!(rms(&out) < rms(frame) / 100.0);
        }

        let stats = aec.get_stats();
        assert_eq!(stats.frames_matched, 50);
        assert_eq!(stats.underflows, 0);
        assert_eq!(stats.overflows, 0);
        assert_eq!(stats.frames_passed_through, 0);
        assert!(stats.playback_active);
    }

    #[test]
    fn test_end_to_end_timestamp_gating() {
        let clock = Arc::new(ManualClock::new(0));
        let aec = AecProcessor::with_clock(
            AecConfig {
                enable_high_pass_filter: false,
                ..AecConfig::default()
            },
            Some(Box::new(SubtractEngine { erle: None })),
            clock.clone(),
        );

        let reference = vec![5000i16; SAMPLE_RATE as usize / 2];
        aec.add_reference_with_delay(&reference, 20_000);

        let silence = [0i16; FRAME_SIZE];
        let mut out = [0i16; FRAME_SIZE];
        for _ in 0..2 {
            aec.process(&silence, &mut out).unwrap();
            clock.advance_ms(10);
        }
        let stats = aec.get_stats();
        assert_eq!(stats.frames_matched, 0);
        assert_eq!(stats.underflows, 0);
        assert_eq!(stats.estimated_delay_ms, 20);

        for frame in reference.chunks(FRAME_SIZE) {
            aec.process(frame, &mut out).unwrap();
            assert!(out.iter().all(|s| *s == 0));
            clock.advance_ms(10);
        }
        let stats = aec.get_stats();
        assert_eq!(stats.frames_matched, 50);
        assert_eq!(stats.underflows, 0);
    }

    #[test]
    fn test_huge_reference_delay_does_not_overflow() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let aec = AecProcessor::with_clock(
            AecConfig {
                enable_high_pass_filter: false,
                ..AecConfig::default()
            },
            Some(Box::new(SubtractEngine { erle: None })),
            clock.clone(),
        );

        aec.add_reference_with_delay(&[1i16; FRAME_SIZE], u64::MAX);
        let mic = [300i16; FRAME_SIZE];
        let mut out = [0i16; FRAME_SIZE];
        aec.process(&mic, &mut out).unwrap();
        // Still gated: the reference is silence
        assert_eq!(out, mic);

        let stats = aec.get_stats();
        assert_eq!(stats.frames_matched, 0);
        assert_eq!(stats.ref_buffer_samples, FRAME_SIZE);
        assert!(stats.playback_active);
    }

    #[test]
    fn test_playback_stop_bumps_discard_sequence() {
        let aec = subtracting(fifo_config());
        aec.add_reference(&[100i16; FRAME_SIZE * 4]);
        let token = aec.discard_sequence().token();
        aec.signal_playback_stop();
        assert!(!aec.discard_sequence().is_current(token));

        let stats = aec.get_stats();
        assert!(!stats.playback_active);
        assert_eq!(stats.ref_buffer_samples, 0);

        // Stale frames must not be paired with later mic audio
        let mic = ramp(FRAME_SIZE);
        let mut out = vec![0i16; FRAME_SIZE];
        aec.process(&mic, &mut out).unwrap();
        assert_eq!(out, mic);
        assert_eq!(aec.get_stats().underflows, 0);
    }

    #[test]
    fn test_reset_clears_store_and_counters() {
        let aec = subtracting(fifo_config());
        aec.add_reference(&[100i16; FRAME_SIZE * 5]);
        let mut out = [0i16; FRAME_SIZE];
        aec.process(&[0i16; FRAME_SIZE], &mut out).unwrap();
        let token = aec.discard_sequence().token();

        aec.reset();
        let stats = aec.get_stats();
        assert_eq!(stats.ref_buffer_samples, 0);
        assert_eq!(stats.frames_processed, 0);
        assert_eq!(stats.frames_matched, 0);
        assert!(!stats.playback_active);
        assert!(!aec.discard_sequence().is_current(token));
    }

    #[test]
    fn test_engine_metrics_are_copied_to_stats() {
        let aec = AecProcessor::new(
            fifo_config(),
            Some(Box::new(SubtractEngine { erle: Some(18.5) })),
        );
        assert_eq!(aec.get_erle(), None);
        assert!(!aec.get_stats().metrics_valid());

        let mut out = [0i16; FRAME_SIZE];
        aec.process(&[0i16; FRAME_SIZE], &mut out).unwrap();
        assert_eq!(aec.get_erle(), Some(18.5));
        assert_eq!(aec.get_residual_echo_likelihood(), None);
        assert!(aec.get_stats().metrics_valid());
    }

    #[test]
    fn test_close_switches_to_pass_through() {
        let aec = subtracting(fifo_config());
        aec.add_reference(&[500i16; FRAME_SIZE]);
        aec.close();
        assert!(!aec.is_enabled());

        let mic = [500i16; FRAME_SIZE];
        let mut out = [0i16; FRAME_SIZE];
        aec.process(&mic, &mut out).unwrap();
        assert_eq!(out, mic);

        // Reset cannot bring back a closed engine
        aec.reset();
        assert!(!aec.is_enabled());
        aec.close();
    }

    #[test]
    fn test_noise_gate_runs_on_cancelled_frames_only() {
        let config = AecConfig {
            noise_gate_threshold: 300,
            ..fifo_config()
        };
        let aec = subtracting(config.clone());
        let mic = [200i16; FRAME_SIZE];
        let mut out = [1i16; FRAME_SIZE];
        aec.process(&mic, &mut out).unwrap();
        assert!(out.iter().all(|s| *s == 0));

        let config = AecConfig {
            max_consecutive_errors: 100,
            ..config
        };
        let failing = AecProcessor::new(config, Some(Box::new(FailingEngine)));
        failing.process(&mic, &mut out).unwrap();
        assert_eq!(out, mic);
    }

    #[test]
    fn test_acoustic_delay_hint_clamped() {
        let aec = subtracting(fifo_config());
        assert_eq!(aec.acoustic_delay_ms(), 70);
        assert_eq!(aec.set_acoustic_delay_ms(3), 10);
        assert_eq!(aec.set_acoustic_delay_ms(450), 200);
        assert_eq!(aec.set_acoustic_delay_ms(42), 42);
        assert_eq!(aec.acoustic_delay_ms(), 42);
    }

    #[test]
    fn test_calibration_updates_delay_hint() {
        let aec = subtracting(fifo_config());
        aec.request_calibration();
        assert!(aec.take_calibration_request());
        aec.start_calibration();
        assert!(aec.is_calibrating());

        // Low-passed noise as the greeting, heard 30ms later at half level
        let mut state = 12345u32;
        let white: Vec<f32> = (0..24_032)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 16) as f32 / 32768.0) - 1.0
            })
            .collect();
        let greeting: Vec<i16> = (0..24_000)
            .map(|i| (white[i..i + 32].iter().sum::<f32>() / 32.0 * 20000.0) as i16)
            .collect();
        let delay = 1_440;
        let mut mic = vec![0i16; 24_000 + 4_800];
        for (i, s) in greeting.iter().enumerate() {
            mic[i + delay] = s / 2;
        }

        for chunk in greeting.chunks(FRAME_SIZE) {
            aec.add_reference(chunk);
        }
        let mut out = vec![0i16; FRAME_SIZE];
        for chunk in mic.chunks(FRAME_SIZE) {
            aec.process(chunk, &mut out[..chunk.len()]).unwrap();
        }

        let result = aec.finish_calibration().unwrap();
        assert_eq!(result.delay_ms, 30);
        assert_eq!(aec.acoustic_delay_ms(), 30);
        assert!(!aec.is_calibrating());
    }

    #[test]
    fn test_recording_captures_processed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let aec = subtracting(fifo_config());
        aec.set_recording_dir(dir.path());
        assert!(aec.start_recording().is_err());

        aec.enable_recording(true);
        let paths = aec.start_recording().unwrap();
        assert!(aec.is_recording());

        aec.add_reference(&[1000i16; FRAME_SIZE * 2]);
        let mic = [1500i16; FRAME_SIZE * 2 + 100];
        let mut out = [0i16; FRAME_SIZE * 2 + 100];
        aec.process(&mic, &mut out).unwrap();

        let summary = aec.stop_recording().unwrap();
        assert_eq!(summary.mic_samples, (FRAME_SIZE * 2 + 100) as u64);
        assert_eq!(summary.ref_samples, summary.mic_samples);
        assert_eq!(summary.out_samples, summary.mic_samples);

        let out_samples: Vec<i16> = hound::WavReader::open(&paths.output)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(out_samples[0], 500);
        assert_eq!(out_samples[FRAME_SIZE * 2], 1500);
    }

    #[test]
    fn test_recorder_write_failure_leaves_output_untouched() {
        let reference = ramp(FRAME_SIZE * 10);
        let mic: Vec<i16> = reference.iter().map(|s| s.saturating_mul(2)).collect();

        let run = |aec: &AecProcessor| {
            aec.add_reference(&reference);
            let mut out = vec![0i16; mic.len()];
            for (m, o) in mic.chunks(FRAME_SIZE).zip(out.chunks_mut(FRAME_SIZE)) {
                aec.process(m, o).unwrap();
            }
            out
        };

        let plain = subtracting(fifo_config());
        let expected = run(&plain);

        let failing = subtracting(fifo_config());
        failing.enable_recording(true);
        let sinks = [
            FailingSink::new(44 + 1000),
            FailingSink::new(44 + 1000),
            FailingSink::new(44 + 1000),
        ];
        failing.recorder.start_with_writers(sinks).unwrap();
        assert!(failing.is_recording());

        assert_eq!(run(&failing), expected);
        let stats = failing.get_stats();
        assert_eq!(stats.frames_matched, 10);
        assert!(stats.is_active);

        let summary = failing.stop_recording().unwrap();
        assert!(summary.write_failed);
    }
}
