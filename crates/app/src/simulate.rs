//! Offline replay of a recorded near-end/far-end pair.
//!
//! Time is driven by a manual clock advanced one frame per step, so the
//! timestamp policy behaves as it would live, only faster.

use anyhow::{Context, Result};
use bargein_core::constants::{FRAME_DURATION_US, FRAME_SIZE};
use bargein_core::{AecConfig, AecProcessor, AecStats, Aec3Engine, EchoEngine, ManualClock};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

use crate::wav;

/// Steps through `mic` in 10ms frames, queueing the matching reference frame
/// (played `delay_us` later) before each `process()` call. Playback stops
/// once the last queued reference frame has been consumed.
pub fn run_frames(
    processor: &AecProcessor,
    clock: &ManualClock,
    mic: &[i16],
    reference: &[i16],
    delay_us: u64,
) -> Result<Vec<i16>> {
    let mut out = vec![0i16; mic.len()];
    let mut ref_chunks = reference.chunks(FRAME_SIZE);
    let mut playing = false;

    for (mic_chunk, out_chunk) in mic.chunks(FRAME_SIZE).zip(out.chunks_mut(FRAME_SIZE)) {
        match ref_chunks.next() {
            Some(chunk) => {
                processor.add_reference_with_delay(chunk, delay_us);
                playing = true;
            }
            None if playing && processor.get_stats().ref_buffer_samples == 0 => {
                processor.signal_playback_stop();
                playing = false;
            }
            None => {}
        }

        processor.process(mic_chunk, out_chunk)?;
        clock.advance_us(FRAME_DURATION_US);
    }

    if playing {
        processor.signal_playback_stop();
    }
    Ok(out)
}

/// Runs the AEC3 pipeline over two WAV files and writes the cancelled output.
pub fn run(
    config: AecConfig,
    mic_path: &Path,
    ref_path: &Path,
    out_path: &Path,
    delay_ms: u32,
    calibrate: bool,
) -> Result<AecStats> {
    let mic = wav::read_mono(mic_path)?;
    let reference = wav::read_mono(ref_path)?;
    info!(
        "Simulating {:.2}s of mic against {:.2}s of reference",
        mic.len() as f32 / FRAME_SIZE as f32 / 100.0,
        reference.len() as f32 / FRAME_SIZE as f32 / 100.0
    );

    let clock = Arc::new(ManualClock::new(0));
    let engine: Option<Box<dyn EchoEngine>> = match Aec3Engine::new() {
        Ok(engine) => Some(Box::new(engine)),
        Err(e) => {
            warn!("AEC3 unavailable, output will equal input: {}", e);
            None
        }
    };
    let processor = AecProcessor::with_clock(config, engine, clock.clone());

    if calibrate {
        processor.start_calibration();
    }

    let out = run_frames(&processor, &clock, &mic, &reference, delay_ms as u64 * 1000)
        .context("Processing failed")?;

    if calibrate {
        match processor.finish_calibration() {
            Ok(result) => println!(
                "Calibration: delay {}ms (correlation {:.2})",
                result.delay_ms, result.correlation
            ),
            Err(e) => println!("Calibration failed: {}", e),
        }
    }

    wav::write_mono(out_path, &out)?;
    println!("Wrote {}", out_path.display());
    Ok(processor.get_stats())
}

pub fn print_stats(stats: &AecStats) {
    println!("Frames processed:      {}", stats.frames_processed);
    println!("Frames without ref:    {}", stats.frames_passed_through);
    println!("Frames matched:        {}", stats.frames_matched);
    println!("Overflows / underflows: {} / {}", stats.overflows, stats.underflows);
    println!("Avg processing time:   {:.1}us", stats.avg_processing_time_us);
    match stats.erle_db {
        Some(erle) => println!("ERLE:                  {:.1}dB", erle),
        None => println!("ERLE:                  unknown"),
    }
    println!("Engine active:         {}", stats.is_active);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bargein_core::{EngineError, SyncPolicy};

    // Removes the reference one-to-one
    struct SubtractEngine;

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

        fn reset(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn processor(policy: SyncPolicy, clock: Arc<ManualClock>) -> AecProcessor {
        let config = AecConfig {
            sync_policy: policy,
            enable_high_pass_filter: false,
            ..AecConfig::default()
        };
        AecProcessor::with_clock(config, Some(Box::new(SubtractEngine)), clock)
    }

    fn tone(len: usize) -> Vec<i16> {
        (0..len).map(|i| ((i % 97) as i16 - 48) * 100).collect()
    }

    #[test]
    fn test_aligned_echo_is_removed() {
        for policy in [SyncPolicy::FillLevel, SyncPolicy::Timestamp] {
            let clock = Arc::new(ManualClock::new(0));
            let processor = processor(policy, clock.clone());
            let reference = tone(FRAME_SIZE * 20);

            let out = run_frames(&processor, &clock, &reference, &reference, 0).unwrap();
            assert!(out.iter().all(|s| *s == 0), "{:?}", policy);

            let stats = processor.get_stats();
            assert_eq!(stats.frames_processed, 20);
            assert_eq!(stats.frames_matched, 20);
            assert!(!stats.playback_active);
        }
    }

    #[test]
    fn test_mic_longer_than_reference_passes_tail() {
        let clock = Arc::new(ManualClock::new(0));
        let processor = processor(SyncPolicy::Timestamp, clock.clone());
        let reference = tone(FRAME_SIZE * 5);
        let mut mic = reference.clone();
        mic.extend(vec![1234i16; FRAME_SIZE * 3]);

        let out = run_frames(&processor, &clock, &mic, &reference, 0).unwrap();
        assert!(out[..FRAME_SIZE * 5].iter().all(|s| *s == 0));
        // Silent reference after playback stopped
        assert!(out[FRAME_SIZE * 5..].iter().all(|s| *s == 1234));
        assert_eq!(processor.get_stats().frames_passed_through, 3);
    }

    #[test]
    fn test_delayed_reference_is_held_back() {
        let clock = Arc::new(ManualClock::new(0));
        let processor = processor(SyncPolicy::Timestamp, clock.clone());
        let reference = tone(FRAME_SIZE * 10);
        // Echo arrives 30ms after the reference is queued
        let mut mic = vec![0i16; FRAME_SIZE * 3];
        mic.extend_from_slice(&reference);

        let out = run_frames(&processor, &clock, &mic, &reference, 30_000).unwrap();
        // The delayed tail is still cancelled after the reference file ends
        assert!(out.iter().all(|s| *s == 0));

        let stats = processor.get_stats();
        assert_eq!(stats.frames_processed, 13);
        assert_eq!(stats.frames_matched, 10);
        assert_eq!(stats.ref_buffer_samples, 0);
        assert!(!stats.playback_active);
    }
}
