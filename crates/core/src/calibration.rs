//! Speaker-to-microphone delay measurement.
//!
//! While a known utterance plays (e.g. a boot greeting) the reference and the
//! raw microphone signal are captured side by side; the lag with the highest
//! normalized cross-correlation is the acoustic delay.

use crate::constants::{ms_to_samples, SAMPLE_RATE};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Largest delay the capture buffers are sized to search.
pub const MAX_DELAY_LIMIT_MS: u32 = 500;
pub const MIN_CORRELATION: f32 = 0.3;
pub const AMBIGUITY_RATIO: f32 = 0.7;

const CAPTURE_SECONDS: usize = 2;
// Lag ranges above this are searched coarsely first
const COARSE_SEARCH_LAGS: usize = 1000;
const COARSE_STEP: usize = 10;

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("max delay must be within 1..=500ms, got {0}ms")]
    InvalidParameter(u32),

    #[error("calibration is not running")]
    NotActive,

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("weak correlation ({0:.3}), speaker muted or no echo path")]
    LowCorrelation(f32),

    #[error("measured delay {0}ms is out of range")]
    OutOfRange(u32),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationResult {
    pub delay_ms: u32,
    pub correlation: f32,
}

/// Capture side of a calibration run. Reference and mic are fed from
/// different threads, each into its own pre-allocated buffer.
pub struct DelayCalibrator {
    max_delay_ms: u32,
    max_delay_samples: usize,
    active: AtomicBool,
    pending: AtomicBool,
    reference: Mutex<Vec<i16>>,
    mic: Mutex<Vec<i16>>,
}

impl DelayCalibrator {
    pub fn new(max_delay_ms: u32) -> Result<Self, CalibrationError> {
        if max_delay_ms == 0 || max_delay_ms > MAX_DELAY_LIMIT_MS {
            return Err(CalibrationError::InvalidParameter(max_delay_ms));
        }
        let max_delay_samples = ms_to_samples(max_delay_ms);
        let ref_capacity = SAMPLE_RATE as usize * CAPTURE_SECONDS;

        Ok(Self {
            max_delay_ms,
            max_delay_samples,
            active: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            reference: Mutex::new(Vec::with_capacity(ref_capacity)),
            mic: Mutex::new(Vec::with_capacity(ref_capacity + max_delay_samples)),
        })
    }

    pub fn max_delay_ms(&self) -> u32 {
        self.max_delay_ms
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks that the next playback should be used for calibration.
    pub fn request(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns and clears the pending request flag.
    pub fn take_request(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn start(&self) {
        self.reference.lock().clear();
        self.mic.lock().clear();
        self.active.store(true, Ordering::Release);
        info!("AEC calibration: started capture");
    }

    pub fn add_reference(&self, samples: &[i16]) {
        if self.is_active() {
            append_bounded(&mut self.reference.lock(), samples);
        }
    }

    pub fn add_mic(&self, samples: &[i16]) {
        if self.is_active() {
            append_bounded(&mut self.mic.lock(), samples);
        }
    }

    /// Stops capture and analyzes what was captured.
    pub fn finish(&self) -> Result<CalibrationResult, CalibrationError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            warn!("AEC calibration: finish called but not active");
            return Err(CalibrationError::NotActive);
        }

        let reference = self.reference.lock();
        let mic = self.mic.lock();
        info!(
            "AEC calibration: analyzing {} ref samples, {} mic samples",
            reference.len(),
            mic.len()
        );
        estimate_delay(&reference, &mic, self.max_delay_samples, self.max_delay_ms)
    }
}

fn append_bounded(buf: &mut Vec<i16>, samples: &[i16]) {
    let space = buf.capacity() - buf.len();
    let n = samples.len().min(space);
    buf.extend_from_slice(&samples[..n]);
}

/// Normalized cross-correlation of `reference` against `mic` shifted by `lag`.
fn correlation_at_lag(reference: &[i16], mic: &[i16], lag: usize) -> f32 {
    let end = reference.len().min(mic.len().saturating_sub(lag));
    if end == 0 {
        return 0.0;
    }

    let (mut xy, mut xx, mut yy) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in reference[..end].iter().zip(&mic[lag..lag + end]) {
        let (x, y) = (*x as f64, *y as f64);
        xy += x * y;
        xx += x * x;
        yy += y * y;
    }

    let denom = (xx * yy).sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (xy / denom) as f32
}

fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Finds the lag (0..=`max_delay_samples`) at which `mic` best matches
/// `reference`.
pub fn estimate_delay(
    reference: &[i16],
    mic: &[i16],
    max_delay_samples: usize,
    max_delay_ms: u32,
) -> Result<CalibrationResult, CalibrationError> {
    let check = reference.len().min(mic.len()).min(SAMPLE_RATE as usize);
    info!(
        "AEC calibration: RMS levels - ref={:.1}, mic={:.1} (checked {} samples)",
        rms(&reference[..check]),
        rms(&mic[..check]),
        check
    );

    // 100ms of reference at minimum
    let min_samples = SAMPLE_RATE as usize / 10;
    if reference.len() < min_samples {
        warn!(
            "AEC calibration: insufficient reference data ({} < {})",
            reference.len(),
            min_samples
        );
        return Err(CalibrationError::InsufficientData(format!(
            "{} reference samples, need {}",
            reference.len(),
            min_samples
        )));
    }

    // Shorten the reference so the full delay range can be searched
    let usable_ref = if mic.len() >= reference.len() {
        if reference.len() > max_delay_samples + min_samples {
            reference.len() - max_delay_samples
        } else {
            info!("AEC calibration: short reference, limited search range");
            reference.len()
        }
    } else {
        // Mic capture lagged behind playback
        if mic.len() < reference.len() / 2 {
            warn!(
                "AEC calibration: insufficient mic data ({} < 50% of {})",
                mic.len(),
                reference.len()
            );
            return Err(CalibrationError::InsufficientData(format!(
                "{} mic samples for {} reference samples",
                mic.len(),
                reference.len()
            )));
        }
        let usable = mic.len().saturating_sub(max_delay_samples);
        if usable < min_samples {
            return Err(CalibrationError::InsufficientData(format!(
                "usable reference too short ({} < {})",
                usable, min_samples
            )));
        }
        usable
    };

    let max_lag = mic.len().saturating_sub(usable_ref).min(max_delay_samples);
    if max_lag == 0 {
        return Err(CalibrationError::InsufficientData(
            "not enough mic data to search any lag".into(),
        ));
    }

    let reference = &reference[..usable_ref];
    let step = if max_lag > COARSE_SEARCH_LAGS { COARSE_STEP } else { 1 };

    let mut best = (f32::MIN, 0usize);
    let mut second = (f32::MIN, 0usize);
    for lag in (0..=max_lag).step_by(step) {
        let corr = correlation_at_lag(reference, mic, lag);
        if corr > best.0 {
            second = best;
            best = (corr, lag);
        } else if corr > second.0 {
            second = (corr, lag);
        }
    }

    if step > 1 && best.1 > 0 {
        let lo = best.1.saturating_sub(step);
        let hi = (best.1 + step).min(max_lag);
        for lag in lo..=hi {
            let corr = correlation_at_lag(reference, mic, lag);
            if corr > best.0 {
                best = (corr, lag);
            }
        }
    }

    let (best_corr, best_lag) = best;
    if best_corr < MIN_CORRELATION {
        warn!(
            "AEC calibration: weak correlation ({:.3} < {:.3}) - possibly muted speakers",
            best_corr, MIN_CORRELATION
        );
        return Err(CalibrationError::LowCorrelation(best_corr));
    }

    let to_ms = |lag: usize| (lag as u64 * 1000 / SAMPLE_RATE as u64) as u32;
    if second.0 > 0.0 && second.0 > best_corr * AMBIGUITY_RATIO {
        // Reverberant room; the best peak is still a usable approximation
        warn!(
            "AEC calibration: ambiguous peaks ({:.3}@{}ms vs {:.3}@{}ms), using best",
            best_corr,
            to_ms(best_lag),
            second.0,
            to_ms(second.1)
        );
    }

    let delay_ms = to_ms(best_lag);
    if delay_ms > max_delay_ms {
        warn!("AEC calibration: delay out of range ({} ms)", delay_ms);
        return Err(CalibrationError::OutOfRange(delay_ms));
    }

    info!(
        "AEC calibration: measured delay = {} ms (correlation = {:.3})",
        delay_ms, best_corr
    );
    Ok(CalibrationResult {
        delay_ms,
        correlation: best_corr,
    })
}
