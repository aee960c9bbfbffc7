use crate::error::EngineError;
use log::{error, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Two-state health machine: active until `threshold` consecutive engine
/// failures, then disabled until [`HealthMonitor::reset`].
pub struct HealthMonitor {
    consecutive_errors: AtomicU32,
    active: AtomicBool,
    threshold: u32,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_errors: AtomicU32::new(0),
            active: AtomicBool::new(true),
            threshold: threshold.max(1),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// Counts one failed frame. Returns `true` if this failure disabled the
    /// pipeline.
    pub fn record_failure(&self, err: &EngineError) -> bool {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if errors == 1 || errors % 100 == 0 {
            warn!("AEC frame failed: {} (consecutive errors: {})", err, errors);
        }

        if errors >= self.threshold && self.active.swap(false, Ordering::AcqRel) {
            error!(
                "AEC disabled after {} consecutive errors - call reset() to re-enable",
                errors
            );
            return true;
        }
        false
    }

    pub fn reset(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }
}
