use crate::constants::{MAX_CONSECUTIVE_ERRORS, MIN_REF_BUFFER_MS};
use log::warn;
use serde::{Deserialize, Serialize};

/// How the reference store decides when a frame may be consumed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Plain FIFO, delay estimated from buffer occupancy
    FillLevel,
    /// FIFO gated by session start + measured output delay
    #[default]
    Timestamp,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoiseSuppressionLevel {
    Low,
    #[default]
    Moderate,
    High,
}

impl NoiseSuppressionLevel {
    /// Wet/dry blend applied after the residual suppressor.
    pub fn strength(self) -> f32 {
        match self {
            Self::Low => 0.5,
            Self::Moderate => 0.8,
            Self::High => 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoiseGateMode {
    /// Zero every sample below the threshold
    #[default]
    Hard,
    /// Envelope follower with attack/hold/release
    Envelope,
}

/// Configuration of the echo cancellation subsystem, read once at construction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AecConfig {
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default)]
    pub enable_noise_suppression: bool,
    #[serde(default)]
    pub noise_suppression_level: NoiseSuppressionLevel,
    #[serde(default = "default_high_pass")]
    pub enable_high_pass_filter: bool,
    #[serde(default)]
    pub mobile_mode: bool,
    #[serde(default = "default_ref_buffer_ms")]
    pub ref_buffer_ms: u32,

    // Post-AEC gate (0 = disabled)
    #[serde(default)]
    pub noise_gate_threshold: i16,
    #[serde(default)]
    pub noise_gate_mode: NoiseGateMode,
    #[serde(default = "default_gate_attack_ms")]
    pub gate_attack_ms: f32,
    #[serde(default = "default_gate_hold_ms")]
    pub gate_hold_ms: f32,
    #[serde(default = "default_gate_release_ms")]
    pub gate_release_ms: f32,
    #[serde(default = "default_gate_range_db")]
    pub gate_range_db: f32,

    #[serde(default = "default_acoustic_delay_ms")]
    pub acoustic_delay_ms: u32,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_high_pass() -> bool {
    true
}

fn default_ref_buffer_ms() -> u32 {
    2000 // 200 frames
}

fn default_gate_attack_ms() -> f32 {
    2.0
}

fn default_gate_hold_ms() -> f32 {
    50.0
}

fn default_gate_release_ms() -> f32 {
    100.0
}

fn default_gate_range_db() -> f32 {
    -60.0
}

fn default_acoustic_delay_ms() -> u32 {
    70 // ALSA buffer (~50ms) + air (~20ms)
}

fn default_max_consecutive_errors() -> u32 {
    MAX_CONSECUTIVE_ERRORS
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            enable_noise_suppression: false,
            noise_suppression_level: NoiseSuppressionLevel::default(),
            enable_high_pass_filter: default_high_pass(),
            mobile_mode: false,
            ref_buffer_ms: default_ref_buffer_ms(),
            noise_gate_threshold: 0,
            noise_gate_mode: NoiseGateMode::default(),
            gate_attack_ms: default_gate_attack_ms(),
            gate_hold_ms: default_gate_hold_ms(),
            gate_release_ms: default_gate_release_ms(),
            gate_range_db: default_gate_range_db(),
            acoustic_delay_ms: default_acoustic_delay_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl AecConfig {
    /// Returns a copy with every out-of-range value clamped into range.
    pub fn validated(&self) -> Self {
        let mut cfg = self.clone();

        if cfg.ref_buffer_ms < MIN_REF_BUFFER_MS {
            warn!(
                "ref_buffer_ms ({}) below minimum ({}), using minimum",
                cfg.ref_buffer_ms, MIN_REF_BUFFER_MS
            );
            cfg.ref_buffer_ms = MIN_REF_BUFFER_MS;
        }

        let delay = cfg.acoustic_delay_ms.clamp(10, 200);
        if delay != cfg.acoustic_delay_ms {
            warn!(
                "acoustic_delay_ms ({}) out of range, clamping to {}",
                cfg.acoustic_delay_ms, delay
            );
            cfg.acoustic_delay_ms = delay;
        }

        if cfg.max_consecutive_errors == 0 {
            warn!("max_consecutive_errors must be at least 1");
            cfg.max_consecutive_errors = 1;
        }

        if cfg.noise_gate_threshold < 0 {
            warn!(
                "noise_gate_threshold ({}) negative, disabling gate",
                cfg.noise_gate_threshold
            );
            cfg.noise_gate_threshold = 0;
        }

        cfg.gate_attack_ms = clamp_logged("gate_attack_ms", cfg.gate_attack_ms, 0.1, 1000.0);
        cfg.gate_hold_ms = clamp_logged("gate_hold_ms", cfg.gate_hold_ms, 0.0, 5000.0);
        cfg.gate_release_ms = clamp_logged("gate_release_ms", cfg.gate_release_ms, 1.0, 5000.0);
        cfg.gate_range_db = clamp_logged("gate_range_db", cfg.gate_range_db, -96.0, 0.0);

        cfg
    }

    /// Number of reference frames the store can hold.
    pub fn ref_buffer_frames(&self) -> usize {
        (self.ref_buffer_ms.max(MIN_REF_BUFFER_MS) as usize / 10).max(1)
    }
}

fn clamp_logged(name: &str, value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() {
        warn!("{} is NaN, using {}", name, min);
        return min;
    }
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{} out of range ({:.1}), clamping to {:.1}", name, value, clamped);
    }
    clamped
}
