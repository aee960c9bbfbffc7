//! Filters around the echo canceller.
//!
//! [`HighPassFilter`] runs on the near-end frame before the engine. The
//! [`PostFilter`] chain runs on successfully cancelled frames only; pass-through
//! frames are never touched.

use crate::config::{AecConfig, NoiseGateMode};
use crate::constants::{FRAME_SIZE, SAMPLE_RATE};
use anyhow::{anyhow, Result};
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use log::info;
use nnnoiseless::DenoiseState;

const HIGH_PASS_CUTOFF_HZ: f32 = 80.0;

/// In-place processing of one cancelled frame.
pub trait PostFilter: Send {
    fn process(&mut self, frame: &mut [i16; FRAME_SIZE]);

    /// Drops any state carried across frames.
    fn reset(&mut self) {}
}

#[inline]
fn to_i16(x: f32) -> i16 {
    x.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// 2nd-order Butterworth high-pass at 80 Hz. Removes DC and rumble.
pub struct HighPassFilter {
    filter: DirectForm2Transposed<f32>,
}

impl HighPassFilter {
    pub fn new() -> Result<Self> {
        let coeffs = Coefficients::<f32>::from_params(
            Type::HighPass,
            SAMPLE_RATE.hz(),
            HIGH_PASS_CUTOFF_HZ.hz(),
            Q_BUTTERWORTH_F32,
        )
        .map_err(|e| anyhow!("Failed to create high-pass filter: {:?}", e))?;
        Ok(Self {
            filter: DirectForm2Transposed::<f32>::new(coeffs),
        })
    }

    pub fn process(&mut self, frame: &mut [i16; FRAME_SIZE]) {
        for s in frame.iter_mut() {
            *s = to_i16(self.filter.run(*s as f32));
        }
    }

    pub fn reset(&mut self) {
        self.filter.reset_state();
    }
}

/// Neural residual echo/noise suppression (RNNoise) with a wet/dry blend.
pub struct ResidualSuppressor {
    denoise: Box<DenoiseState<'static>>,
    strength: f32,
    input: [f32; FRAME_SIZE],
    output: [f32; FRAME_SIZE],
}

// SAFETY: same reasoning as the engine: the suppressor is owned by the
// processor's engine slot and only used under the processing mutex.
#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for ResidualSuppressor {}

impl ResidualSuppressor {
    pub fn new(strength: f32) -> Self {
        Self {
            denoise: DenoiseState::new(),
            strength: strength.clamp(0.0, 1.0),
            input: [0.0; FRAME_SIZE],
            output: [0.0; FRAME_SIZE],
        }
    }
}

impl PostFilter for ResidualSuppressor {
    fn process(&mut self, frame: &mut [i16; FRAME_SIZE]) {
        // nnnoiseless works on i16-scaled floats
        for (dst, s) in self.input.iter_mut().zip(frame.iter()) {
            *dst = *s as f32;
        }
        self.denoise.process_frame(&mut self.output, &self.input);

        let wet = self.strength;
        let dry = 1.0 - wet;
        for i in 0..FRAME_SIZE {
            frame[i] = to_i16(self.input[i] * dry + self.output[i] * wet);
        }
    }

    fn reset(&mut self) {
        self.denoise = DenoiseState::new();
    }
}

/// Hard amplitude gate: zeroes every sample whose magnitude is below the
/// threshold. Stateless.
pub struct NoiseGate {
    threshold: i32,
}

impl NoiseGate {
    pub fn new(threshold: i16) -> Self {
        Self {
            threshold: threshold.max(0) as i32,
        }
    }
}

impl PostFilter for NoiseGate {
    fn process(&mut self, frame: &mut [i16; FRAME_SIZE]) {
        for s in frame.iter_mut() {
            if (*s as i32).abs() < self.threshold {
                *s = 0;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Closed,
    Attack,
    Open,
    Hold,
    Release,
}

/// Envelope-following gate with attack/hold/release gain ramps.
pub struct EnvelopeGate {
    threshold: f32,
    state: GateState,
    envelope: f32,
    gain: f32,
    hold_remaining: i32,

    env_attack: f32,
    env_release: f32,
    gain_attack_step: f32,
    gain_release_step: f32,
    hold_samples: i32,
    range_linear: f32,
}

impl EnvelopeGate {
    pub fn new(threshold: i16, attack_ms: f32, hold_ms: f32, release_ms: f32, range_db: f32) -> Self {
        let rate = SAMPLE_RATE as f32 / 1000.0;
        let attack_samples = (attack_ms * rate).max(1.0);
        let release_samples = (release_ms * rate).max(1.0);
        let range_linear = 10f32.powf(range_db / 20.0);

        Self {
            threshold: threshold.max(0) as f32,
            state: GateState::Closed,
            envelope: 0.0,
            gain: range_linear,
            hold_remaining: 0,
            // ~3 time constants over the configured time
            env_attack: 1.0 - (-2.2 / attack_samples).exp(),
            env_release: 1.0 - (-2.2 / release_samples).exp(),
            gain_attack_step: 1.0 / attack_samples,
            gain_release_step: 1.0 / release_samples,
            hold_samples: (hold_ms * rate) as i32,
            range_linear,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    fn step(&mut self, magnitude: f32) {
        let coeff = if magnitude > self.envelope {
            self.env_attack
        } else {
            self.env_release
        };
        self.envelope += coeff * (magnitude - self.envelope);
        let above = self.envelope > self.threshold;

        match self.state {
            GateState::Closed => {
                if above {
                    self.state = GateState::Attack;
                }
            }
            GateState::Attack => {
                self.gain += self.gain_attack_step;
                if self.gain >= 1.0 {
                    self.gain = 1.0;
                    self.state = GateState::Open;
                }
                if !above {
                    self.state = GateState::Hold;
                    self.hold_remaining = self.hold_samples;
                }
            }
            GateState::Open => {
                // Re-entered from a partial attack via Hold: keep ramping
                self.gain = (self.gain + self.gain_attack_step).min(1.0);
                if !above {
                    self.state = GateState::Hold;
                    self.hold_remaining = self.hold_samples;
                }
            }
            GateState::Hold => {
                // Gain stays where Attack or Open left it
                if above {
                    self.state = GateState::Open;
                } else {
                    self.hold_remaining -= 1;
                    if self.hold_remaining <= 0 {
                        self.state = GateState::Release;
                    }
                }
            }
            GateState::Release => {
                self.gain -= self.gain_release_step;
                if self.gain <= self.range_linear {
                    self.gain = self.range_linear;
                    self.state = GateState::Closed;
                }
                if above {
                    self.state = GateState::Attack;
                }
            }
        }
    }
}

impl PostFilter for EnvelopeGate {
    fn process(&mut self, frame: &mut [i16; FRAME_SIZE]) {
        for s in frame.iter_mut() {
            self.step((*s as f32).abs());
            *s = to_i16(*s as f32 * self.gain);
        }
    }

    fn reset(&mut self) {
        self.state = GateState::Closed;
        self.envelope = 0.0;
        self.gain = self.range_linear;
        self.hold_remaining = 0;
    }
}

/// Builds the post-filter chain for a validated config, in processing order.
pub fn build_post_filters(config: &AecConfig) -> Vec<Box<dyn PostFilter>> {
    let mut filters: Vec<Box<dyn PostFilter>> = Vec::new();

    if config.enable_noise_suppression {
        if config.mobile_mode {
            info!("AEC: mobile mode, residual suppressor disabled");
        } else {
            let strength = config.noise_suppression_level.strength();
            info!("AEC: residual suppressor enabled (strength={:.1})", strength);
            filters.push(Box::new(ResidualSuppressor::new(strength)));
        }
    }

    if config.noise_gate_threshold > 0 {
        match config.noise_gate_mode {
            NoiseGateMode::Hard => {
                info!("AEC gate: hard, threshold={}", config.noise_gate_threshold);
                filters.push(Box::new(NoiseGate::new(config.noise_gate_threshold)));
            }
            NoiseGateMode::Envelope => {
                info!(
                    "AEC gate: threshold={}, attack={:.1}ms, hold={:.0}ms, release={:.0}ms, range={:.1}dB",
                    config.noise_gate_threshold,
                    config.gate_attack_ms,
                    config.gate_hold_ms,
                    config.gate_release_ms,
                    config.gate_range_db
                );
                filters.push(Box::new(EnvelopeGate::new(
                    config.noise_gate_threshold,
                    config.gate_attack_ms,
                    config.gate_hold_ms,
                    config.gate_release_ms,
                    config.gate_range_db,
                )));
            }
        }
    } else {
        info!("AEC gate: disabled");
    }

    filters
}
