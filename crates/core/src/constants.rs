//! Shared constants for the echo cancellation subsystem.

/// Sample rate of the microphone, the reference stream and the engine (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame size in samples (10ms at 48kHz = 480 samples)
pub const FRAME_SIZE: usize = 480;

/// Largest buffer accepted by a single `process()` call (~170ms at 48kHz).
/// Bounds the time the capture thread can spend inside the subsystem.
pub const MAX_SAMPLES: usize = 8192;

/// Consecutive engine failures before the subsystem falls back to pass-through
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Smallest reference buffer we accept, in milliseconds
pub const MIN_REF_BUFFER_MS: u32 = 100;

/// Duration of one frame in microseconds
pub const FRAME_DURATION_US: u64 = FRAME_SIZE as u64 * 1_000_000 / SAMPLE_RATE as u64;

/// Converts a sample count at `SAMPLE_RATE` into microseconds.
pub const fn samples_to_us(samples: usize) -> u64 {
    samples as u64 * 1_000_000 / SAMPLE_RATE as u64
}

/// Converts milliseconds into a sample count at `SAMPLE_RATE`.
pub const fn ms_to_samples(ms: u32) -> usize {
    (ms as usize * SAMPLE_RATE as usize) / 1000
}
