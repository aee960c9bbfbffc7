use thiserror::Error;

/// Caller-side misuse of [`crate::AecProcessor::process`].
///
/// On either error the output buffer is zero-filled (as far as it reaches)
/// before returning.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AecError {
    #[error("output buffer holds {output} samples but input has {input}")]
    LengthMismatch { input: usize, output: usize },

    #[error("{len} samples exceeds the per-call limit of {max}")]
    TooManySamples { len: usize, max: usize },
}

/// Failure reported by an echo cancellation engine for a single frame.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("frame processing failed: {0}")]
    Processing(String),

    #[error("engine unavailable")]
    Unavailable,
}
