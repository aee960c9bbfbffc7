//! Running statistics and the snapshot handed to other threads.

use crate::echo_cancel::EngineMetrics;
use crate::store::StoreStats;

/// Point-in-time copy of the subsystem counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AecStats {
    pub estimated_delay_ms: u32,
    pub ref_buffer_samples: usize,
    pub consecutive_errors: u32,
    pub is_active: bool,
    pub playback_active: bool,
    pub avg_processing_time_us: f32,
    pub avg_drift_us: f32,
    pub frames_processed: u64,
    /// Frames processed with no reference available (silent reference)
    pub frames_passed_through: u64,
    pub frames_matched: u64,
    pub overflows: u64,
    pub underflows: u64,
    pub erle_db: Option<f32>,
    pub residual_echo_likelihood: Option<f32>,
}

impl AecStats {
    /// False means "unknown": some engines never report echo metrics.
    pub fn metrics_valid(&self) -> bool {
        self.erle_db.is_some()
    }
}

/// Counters owned by the capture path, kept next to the frame store under the
/// bookkeeping lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) frames_processed: u64,
    pub(crate) frames_passed_through: u64,
    pub(crate) avg_processing_time_us: f32,
    pub(crate) metrics: EngineMetrics,
}

impl Counters {
    pub(crate) fn record_processing_time(&mut self, elapsed_us: f32) {
        self.avg_processing_time_us = self.avg_processing_time_us * 0.99 + elapsed_us * 0.01;
    }

    pub(crate) fn snapshot(
        &self,
        store: &StoreStats,
        estimated_delay_ms: u32,
        consecutive_errors: u32,
        is_active: bool,
    ) -> AecStats {
        AecStats {
            estimated_delay_ms,
            ref_buffer_samples: store.queued_samples(),
            consecutive_errors,
            is_active,
            playback_active: store.playback_active,
            avg_processing_time_us: self.avg_processing_time_us,
            avg_drift_us: store.avg_drift_us,
            frames_processed: self.frames_processed,
            frames_passed_through: self.frames_passed_through,
            frames_matched: store.frames_matched,
            overflows: store.overflows,
            underflows: store.underflows,
            erle_db: self.metrics.erle_db,
            residual_echo_likelihood: self.metrics.residual_echo_likelihood,
        }
    }
}

/// Speech-detection threshold advice for the voice pipeline.
///
/// With no playback, or with playback and a known ERLE of at least
/// `min_erle_db`, the normal threshold applies. Otherwise residual echo may
/// look like speech and the raised threshold is returned.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VadGate {
    pub speech_threshold: f32,
    pub playback_speech_threshold: f32,
    pub min_erle_db: f32,
}

impl Default for VadGate {
    fn default() -> Self {
        Self {
            speech_threshold: 0.5,
            playback_speech_threshold: 0.92,
            min_erle_db: 6.0,
        }
    }
}

impl VadGate {
    pub fn threshold_for(&self, stats: &AecStats) -> f32 {
        if !stats.playback_active {
            return self.speech_threshold;
        }
        match stats.erle_db {
            Some(erle) if erle >= self.min_erle_db => self.speech_threshold,
            _ => self.playback_speech_threshold,
        }
    }
}
