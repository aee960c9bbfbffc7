use anyhow::{Context, Result};
use bargein_core::constants::{FRAME_SIZE, SAMPLE_RATE};
use bargein_core::echo_cancel::{f32_to_i16, i16_to_f32};
use bargein_core::AecProcessor;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, info, warn};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Frames captured before a requested calibration is analyzed (~3s)
const CALIBRATION_FRAMES: u32 = 300;

// Statistics line once per second
const STATS_INTERVAL_FRAMES: u32 = 100;

fn find_input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    let device = if name == "default" {
        host.default_input_device().context("No default input found")?
    } else {
        host.input_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .context("Input device not found")?
    };
    info!("Using input device: {}", device.name().unwrap_or_default());
    Ok(device)
}

fn find_output_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    let device = if name == "default" {
        host.default_output_device().context("No default output found")?
    } else {
        host.output_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .context("Output device not found")?
    };
    info!("Using output device: {}", device.name().unwrap_or_default());
    Ok(device)
}

/// Live loopback: plays a prompt through the speaker while the microphone is
/// echo-cancelled against it.
///
/// Three threads touch the shared [`AecProcessor`]: the playback thread feeds
/// the speaker ring and the reference, the capture worker runs `process()` on
/// 10ms frames, and the caller's thread may stop playback at any time.
pub struct LoopbackEngine {
    _input_stream: cpal::Stream,
    _output_stream: cpal::Stream,
    is_running: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    processor: Arc<AecProcessor>,
    workers: Vec<JoinHandle<()>>,
}

impl LoopbackEngine {
    pub fn start(
        processor: Arc<AecProcessor>,
        input_device_name: &str,
        output_device_name: &str,
        prompt: Vec<i16>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        info!("Audio host: {}", host.id().name());

        let input_device = find_input_device(&host, input_device_name)?;
        let output_device = find_output_device(&host, output_device_name)?;

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        // 100ms on each side
        let buffer_size = (SAMPLE_RATE as usize) / 10;

        let rb_in = HeapRb::<f32>::new(buffer_size);
        let (mut prod_in, mut cons_in) = rb_in.split();

        let rb_out = HeapRb::<f32>::new(buffer_size);
        let (mut prod_out, mut cons_out) = rb_out.split();

        let input_stream = input_device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let _ = prod_in.push_slice(data);
            },
            |err| warn!("Input error: {}", err),
            None,
        )?;

        let output_stream = output_device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let read = cons_out.pop_slice(data);
                for sample in data.iter_mut().skip(read) {
                    *sample = 0.0;
                }
            },
            |err| warn!("Output error: {}", err),
            None,
        )?;

        let is_running = Arc::new(AtomicBool::new(true));
        let playing = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::with_capacity(2);

        let run_flag = is_running.clone();
        let play_flag = playing.clone();
        let aec = processor.clone();
        workers.push(
            thread::Builder::new()
                .name("bargein-playback".into())
                .spawn(move || {
                    let mut frame = [0.0f32; FRAME_SIZE];
                    let keep_playing =
                        || run_flag.load(Ordering::Relaxed) && play_flag.load(Ordering::Acquire);
                    for chunk in prompt.chunks(FRAME_SIZE) {
                        while keep_playing() && prod_out.vacant_len() < chunk.len() {
                            thread::sleep(Duration::from_millis(2));
                        }
                        if !keep_playing() {
                            return;
                        }

                        let played = play_chunk(&aec, chunk, |chunk| {
                            for (dst, src) in frame.iter_mut().zip(chunk) {
                                *dst = i16_to_f32(*src);
                            }
                            prod_out.push_slice(&frame[..chunk.len()]);
                        });
                        if !played {
                            return;
                        }
                    }

                    // The queued tail still has to leave the speaker and reach the mic
                    while keep_playing() && prod_out.occupied_len() > 0 {
                        thread::sleep(Duration::from_millis(2));
                    }
                    let tail = Duration::from_millis(aec.acoustic_delay_ms() as u64);
                    let drained_at = Instant::now();
                    while keep_playing() && drained_at.elapsed() < tail {
                        thread::sleep(Duration::from_millis(2));
                    }
                    if keep_playing() {
                        info!("Prompt finished");
                        aec.signal_playback_stop();
                    }
                })
                .context("Failed to spawn playback thread")?,
        );

        let run_flag = is_running.clone();
        let aec = processor.clone();
        workers.push(
            thread::Builder::new()
                .name("bargein-capture".into())
                .spawn(move || {
                    let mut input_frame = [0.0f32; FRAME_SIZE];
                    let mut mic = [0i16; FRAME_SIZE];
                    let mut out = [0i16; FRAME_SIZE];
                    let mut frames = 0u32;
                    let mut calibration_frames = 0u32;
                    let mut mic_energy = 0.0f64;
                    let mut out_energy = 0.0f64;
                    let mut last_report = Instant::now();

                    while run_flag.load(Ordering::Relaxed) {
                        if cons_in.occupied_len() < FRAME_SIZE {
                            thread::sleep(Duration::from_micros(200));
                            continue;
                        }
                        cons_in.pop_slice(&mut input_frame);
                        for (dst, src) in mic.iter_mut().zip(input_frame.iter()) {
                            *dst = f32_to_i16(*src);
                        }

                        if aec.take_calibration_request() {
                            info!("Calibration started, keep the prompt playing");
                            aec.start_calibration();
                            calibration_frames = 0;
                        }

                        if let Err(e) = aec.process(&mic, &mut out) {
                            warn!("AEC process failed: {}", e);
                            continue;
                        }

                        if aec.is_calibrating() {
                            calibration_frames += 1;
                            if calibration_frames >= CALIBRATION_FRAMES {
                                match aec.finish_calibration() {
                                    Ok(result) => info!(
                                        "Calibration: delay {}ms (correlation {:.2})",
                                        result.delay_ms, result.correlation
                                    ),
                                    Err(e) => warn!("Calibration failed: {}", e),
                                }
                            }
                        }

                        mic_energy += energy(&mic);
                        out_energy += energy(&out);
                        frames += 1;
                        if frames >= STATS_INTERVAL_FRAMES {
                            log_stats(&aec, mic_energy, out_energy, frames, last_report.elapsed());
                            frames = 0;
                            mic_energy = 0.0;
                            out_energy = 0.0;
                            last_report = Instant::now();
                        }
                    }
                })
                .context("Failed to spawn capture thread")?,
        );

        input_stream.play()?;
        output_stream.play()?;

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
            is_running,
            playing,
            processor,
            workers,
        })
    }

    /// Stops playback immediately, as a barge-in would.
    pub fn interrupt(&self) {
        info!("Playback interrupted");
        self.playing.store(false, Ordering::Release);
        self.processor.signal_playback_stop();
    }
}

/// Writes one prompt chunk to the speaker, then queues it as reference.
/// Returns false if playback was stopped while the chunk was in flight; the
/// session is stopped again so the late reference is discarded with it.
fn play_chunk(aec: &AecProcessor, chunk: &[i16], write: impl FnOnce(&[i16])) -> bool {
    let token = aec.discard_sequence().token();
    write(chunk);
    aec.add_reference(chunk);
    if aec.discard_sequence().is_current(token) {
        return true;
    }
    debug!("Playback stopped during write, dropping chunk");
    aec.signal_playback_stop();
    false
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.processor.signal_playback_stop();
    }
}

fn energy(samples: &[i16]) -> f64 {
    samples.iter().map(|s| (*s as f64) * (*s as f64)).sum()
}

fn log_stats(aec: &AecProcessor, mic_energy: f64, out_energy: f64, frames: u32, elapsed: Duration) {
    let stats = aec.get_stats();
    let attenuation_db = if out_energy > 0.0 && mic_energy > 0.0 {
        10.0 * (mic_energy / out_energy).log10()
    } else {
        0.0
    };
    let erle = stats
        .erle_db
        .map(|e| format!("{:.1}dB", e))
        .unwrap_or_else(|| "n/a".to_string());
    info!(
        "AEC: {} frames in {}ms, atten {:.1}dB, ERLE {}, delay {}ms, ref {} samples, \
         matched {}, under {}, over {}, {:.0}us/frame, active={}",
        frames,
        elapsed.as_millis(),
        attenuation_db,
        erle,
        stats.estimated_delay_ms,
        stats.ref_buffer_samples,
        stats.frames_matched,
        stats.underflows,
        stats.overflows,
        stats.avg_processing_time_us,
        stats.is_active
    );
}

pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    println!("Audio Host: {}", host.id().name());
    println!("\nInput Devices:");
    for device in host.input_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    println!("\nOutput Devices:");
    for device in host.output_devices()? {
        println!("  - {}", device.name().unwrap_or("Unknown".to_string()));
    }
    Ok(())
}
