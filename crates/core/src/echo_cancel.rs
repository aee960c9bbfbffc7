//! Echo cancellation engine boundary.
//!
//! The processor only sees [`EchoEngine`]; the production implementation wraps
//! the aec3 crate (Rust port of WebRTC AEC3).

use crate::constants::{FRAME_SIZE, SAMPLE_RATE};
use crate::error::EngineError;
use aec3::voip::VoipAec3;
use log::warn;

/// Optional quality metrics. `None` means the engine does not know, not zero.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineMetrics {
    pub erle_db: Option<f32>,
    pub residual_echo_likelihood: Option<f32>,
}

/// One-frame echo canceller operating on 16-bit PCM at `SAMPLE_RATE`.
pub trait EchoEngine: Send {
    fn cancel(
        &mut self,
        mic: &[i16; FRAME_SIZE],
        reference: &[i16; FRAME_SIZE],
        out: &mut [i16; FRAME_SIZE],
    ) -> Result<(), EngineError>;

    fn metrics(&self) -> EngineMetrics {
        EngineMetrics::default()
    }

    /// Drops adaptive state, as if freshly constructed.
    fn reset(&mut self) -> Result<(), EngineError>;
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

// Mean square below this counts as "no far-end signal" (about -60 dBFS)
const REF_ACTIVE_ENERGY: f32 = 1e-6;
const ERLE_SMOOTHING: f32 = 0.95;
const ERLE_WARMUP_FRAMES: u32 = 50;

/// ERLE estimate from smoothed near-end vs output energy, updated only while
/// the reference carries signal.
#[derive(Default)]
pub struct ErleEstimator {
    near_energy: f32,
    out_energy: f32,
    active_frames: u32,
}

impl ErleEstimator {
    pub fn update(&mut self, mic: &[f32], reference: &[f32], out: &[f32]) {
        if mean_square(reference) < REF_ACTIVE_ENERGY {
            return;
        }
        let a = ERLE_SMOOTHING;
        self.near_energy = self.near_energy * a + mean_square(mic) * (1.0 - a);
        self.out_energy = self.out_energy * a + mean_square(out) * (1.0 - a);
        self.active_frames = self.active_frames.saturating_add(1);
    }

    pub fn erle_db(&self) -> Option<f32> {
        if self.active_frames < ERLE_WARMUP_FRAMES || self.near_energy <= 0.0 {
            return None;
        }
        Some(10.0 * (self.near_energy / self.out_energy.max(1e-10)).log10())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn mean_square(x: &[f32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().map(|s| s * s).sum::<f32>() / x.len() as f32
}

/// AEC3-backed engine, 48 kHz mono.
pub struct Aec3Engine {
    aec: VoipAec3,
    // Pre-allocated to avoid heap allocation per frame
    mic_buf: [f32; FRAME_SIZE],
    ref_buf: [f32; FRAME_SIZE],
    out_buf: [f32; FRAME_SIZE],
    erle: ErleEstimator,
}

// SAFETY: VoipAec3 holds raw pointers internally, which blocks auto-Send. The
// engine is exclusively owned by the processor's engine slot and only touched
// while the processing mutex is held, so it is never aliased across threads.
#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for Aec3Engine {}

fn build_aec3() -> Result<VoipAec3, EngineError> {
    VoipAec3::builder(SAMPLE_RATE as usize, 1, 1)
        .build()
        .map_err(|e| {
            warn!("AEC3 initialization failed: {:?}", e);
            EngineError::Unavailable
        })
}

impl Aec3Engine {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            aec: build_aec3()?,
            mic_buf: [0.0; FRAME_SIZE],
            ref_buf: [0.0; FRAME_SIZE],
            out_buf: [0.0; FRAME_SIZE],
            erle: ErleEstimator::default(),
        })
    }
}

impl EchoEngine for Aec3Engine {
    fn cancel(
        &mut self,
        mic: &[i16; FRAME_SIZE],
        reference: &[i16; FRAME_SIZE],
        out: &mut [i16; FRAME_SIZE],
    ) -> Result<(), EngineError> {
        for i in 0..FRAME_SIZE {
            self.mic_buf[i] = i16_to_f32(mic[i]);
            self.ref_buf[i] = i16_to_f32(reference[i]);
        }
        self.out_buf.fill(0.0);

        // level_change = false: playback volume is not tracked
        self.aec
            .process(&self.mic_buf, Some(&self.ref_buf[..]), false, &mut self.out_buf)
            .map_err(|e| EngineError::Processing(format!("{:?}", e)))?;

        for (o, s) in out.iter_mut().zip(self.out_buf.iter()) {
            *o = f32_to_i16(*s);
        }
        self.erle.update(&self.mic_buf, &self.ref_buf, &self.out_buf);
        Ok(())
    }

    fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            erle_db: self.erle.erle_db(),
            residual_echo_likelihood: None,
        }
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.aec = build_aec3()?;
        self.erle.reset();
        Ok(())
    }
}
