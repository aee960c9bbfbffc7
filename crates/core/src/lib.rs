//! Reference/microphone synchronization and echo cancellation for a
//! barge-in capable voice satellite.

pub mod calibration;
pub mod clock;
pub mod config;
pub mod constants;
pub mod discard;
pub mod echo_cancel;
pub mod error;
pub mod health;
pub mod post_filter;
pub mod processor;
pub mod recorder;
pub mod store;
pub mod telemetry;

pub use calibration::{CalibrationError, CalibrationResult};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AecConfig, NoiseGateMode, NoiseSuppressionLevel, SyncPolicy};
pub use discard::DiscardSequence;
pub use echo_cancel::{Aec3Engine, EchoEngine, EngineMetrics};
pub use error::{AecError, EngineError};
pub use processor::AecProcessor;
pub use recorder::{RecordingPaths, RecordingSummary};
pub use store::{FrameStore, ReferenceFrame};
pub use telemetry::{AecStats, VadGate};
