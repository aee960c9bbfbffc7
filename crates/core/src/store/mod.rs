//! Reference (far-end) frame storage.
//!
//! The playback thread writes arbitrarily sized chunks; the capture thread
//! pulls exactly one `FRAME_SIZE` frame per 10ms of microphone audio. Two
//! strategies decide *when* a queued frame may be handed out, both always
//! hand frames out in write order:
//!
//! * [`FillLevelStore`]: a plain sample FIFO, delay is inferred from occupancy.
//! * [`TimestampStore`]: frames carry a presentation timestamp and draining
//!   only begins once the session start plus the output delay has elapsed.

mod fill_level;
mod timestamp;

pub use fill_level::FillLevelStore;
pub use timestamp::TimestampStore;

use crate::config::{AecConfig, SyncPolicy};
use crate::constants::{samples_to_us, FRAME_SIZE};
use log::info;

/// One 10ms frame of reference audio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReferenceFrame {
    pub samples: [i16; FRAME_SIZE],
    /// Expected speaker output time (monotonic µs), timestamp policy only
    pub pts_us: Option<u64>,
}

impl ReferenceFrame {
    pub fn silent() -> Self {
        Self {
            samples: [0; FRAME_SIZE],
            pts_us: None,
        }
    }
}

/// Counters of one playback session, logged when it stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub matched: u64,
    pub overflows: u64,
    pub underflows: u64,
    pub discarded_frames: usize,
    pub duration_us: u64,
}

/// Point-in-time view of a store, taken under the bookkeeping lock.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StoreStats {
    pub queued_frames: usize,
    pub capacity_frames: usize,
    pub frames_written: u64,
    pub frames_matched: u64,
    pub overflows: u64,
    pub underflows: u64,
    pub gated_reads: u64,
    pub avg_drift_us: f32,
    pub playback_active: bool,
}

impl StoreStats {
    pub fn queued_samples(&self) -> usize {
        self.queued_frames * FRAME_SIZE
    }
}

/// Frame storage strategy shared by the producer (playback) and the consumer
/// (capture) through the subsystem's bookkeeping lock.
pub trait FrameStore: Send {
    /// Appends reference samples. Opens a session if none is active.
    fn write(&mut self, samples: &[i16], now_us: u64, output_delay_us: u64);

    /// Pops the next frame if one is ready. Never blocks.
    fn try_read_frame(&mut self, now_us: u64) -> Option<ReferenceFrame>;

    fn start_session(&mut self, now_us: u64, output_delay_us: u64);

    /// Ends the active session and drops audio queued for it.
    /// Returns `None` when no session was active.
    fn stop_session(&mut self, now_us: u64) -> Option<SessionSummary>;

    fn is_session_active(&self) -> bool;

    /// Drops everything: queued frames, partial frame, session and counters.
    fn clear(&mut self);

    fn stats(&self) -> StoreStats;

    fn estimated_delay_ms(&self) -> u32;
}

/// Builds the store selected by `config.sync_policy`.
pub fn build_store(config: &AecConfig) -> Box<dyn FrameStore> {
    let frames = config.ref_buffer_frames();
    info!(
        "Reference store: {:?} policy, {} frames ({}ms)",
        config.sync_policy,
        frames,
        frames * 10
    );
    match config.sync_policy {
        SyncPolicy::FillLevel => Box::new(FillLevelStore::new(frames)),
        SyncPolicy::Timestamp => Box::new(TimestampStore::new(frames)),
    }
}

/// Coalesces arbitrarily sized writes into whole frames.
pub(crate) struct Accumulator {
    samples: [i16; FRAME_SIZE],
    len: usize,
    pts_us: u64,
}

impl Accumulator {
    pub(crate) fn new() -> Self {
        Self {
            samples: [0; FRAME_SIZE],
            len: 0,
            pts_us: 0,
        }
    }

    /// Feeds `input`, calling `emit` for every completed frame with the
    /// timestamp of that frame's first sample (`base_pts_us` + offset).
    pub(crate) fn feed(
        &mut self,
        input: &[i16],
        base_pts_us: u64,
        mut emit: impl FnMut(&[i16; FRAME_SIZE], u64),
    ) {
        let mut offset = 0;
        while offset < input.len() {
            if self.len == 0 {
                self.pts_us = base_pts_us.saturating_add(samples_to_us(offset));
            }
            let take = (input.len() - offset).min(FRAME_SIZE - self.len);
            self.samples[self.len..self.len + take].copy_from_slice(&input[offset..offset + take]);
            self.len += take;
            offset += take;

            if self.len == FRAME_SIZE {
                emit(&self.samples, self.pts_us);
                self.len = 0;
            }
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.len
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }
}

/// Playback session bookkeeping shared by both strategies.
#[derive(Default)]
pub(crate) struct PlaybackSession {
    pub(crate) active: bool,
    pub(crate) start_us: u64,
    pub(crate) output_delay_us: u64,
    pub(crate) matched: u64,
    pub(crate) overflows: u64,
    pub(crate) underflows: u64,
}

impl PlaybackSession {
    pub(crate) fn start(&mut self, now_us: u64, output_delay_us: u64) {
        *self = Self {
            active: true,
            start_us: now_us,
            output_delay_us,
            ..Self::default()
        };
        info!(
            "AEC: playback started (delay={}ms)",
            output_delay_us / 1000
        );
    }

    pub(crate) fn stop(&mut self, now_us: u64, discarded_frames: usize) -> Option<SessionSummary> {
        if !self.active {
            return None;
        }
        let summary = SessionSummary {
            matched: self.matched,
            overflows: self.overflows,
            underflows: self.underflows,
            discarded_frames,
            duration_us: now_us.saturating_sub(self.start_us),
        };
        *self = Self::default();
        info!(
            "AEC: playback stopped (match={} over={} under={} discarded={})",
            summary.matched, summary.overflows, summary.underflows, summary.discarded_frames
        );
        Some(summary)
    }

    /// True once the first frame can plausibly have reached the speaker.
    pub(crate) fn is_released(&self, now_us: u64) -> bool {
        now_us >= self.start_us.saturating_add(self.output_delay_us)
    }
}
