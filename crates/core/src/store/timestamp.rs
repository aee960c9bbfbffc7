use super::{Accumulator, FrameStore, PlaybackSession, ReferenceFrame, SessionSummary, StoreStats};
use crate::constants::FRAME_SIZE;
use log::{debug, warn};

#[derive(Clone, Copy)]
struct Slot {
    frame: ReferenceFrame,
    valid: bool,
}

/// Fixed-capacity queue of timestamped frames.
///
/// Each frame's PTS is the write time plus the output delay plus the sample
/// offset within the write. Draining starts once `start + output_delay` has
/// passed and then proceeds strictly in order, one frame per read.
pub struct TimestampStore {
    slots: Vec<Slot>,
    head: usize,
    len: usize,
    acc: Accumulator,
    session: PlaybackSession,
    frames_written: u64,
    frames_matched: u64,
    overflows: u64,
    underflows: u64,
    gated_reads: u64,
    avg_drift_us: f32,
}

impl TimestampStore {
    pub fn new(capacity_frames: usize) -> Self {
        let empty = Slot {
            frame: ReferenceFrame::silent(),
            valid: false,
        };
        Self {
            slots: vec![empty; capacity_frames.max(1)],
            head: 0,
            len: 0,
            acc: Accumulator::new(),
            session: PlaybackSession::default(),
            frames_written: 0,
            frames_matched: 0,
            overflows: 0,
            underflows: 0,
            gated_reads: 0,
            avg_drift_us: 0.0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push_frame(&mut self, samples: &[i16; FRAME_SIZE], pts_us: u64) {
        if self.len == self.capacity() {
            self.slots[self.head].valid = false;
            self.head = (self.head + 1) % self.capacity();
            self.len -= 1;
            self.overflows += 1;
            self.session.overflows += 1;
            if self.overflows == 1 || self.overflows % 100 == 0 {
                warn!("AEC: reference overflow, dropped oldest frame (total={})", self.overflows);
            }
        }

        let idx = (self.head + self.len) % self.capacity();
        self.slots[idx] = Slot {
            frame: ReferenceFrame {
                samples: *samples,
                pts_us: Some(pts_us),
            },
            valid: true,
        };
        self.len += 1;
        self.frames_written += 1;
    }

    fn drop_queued(&mut self) -> usize {
        let dropped = self.len;
        for slot in &mut self.slots {
            slot.valid = false;
        }
        self.head = 0;
        self.len = 0;
        self.acc.clear();
        dropped
    }
}

impl FrameStore for TimestampStore {
    fn write(&mut self, samples: &[i16], now_us: u64, output_delay_us: u64) {
        if !self.session.active {
            self.session.start(now_us, output_delay_us);
        }

        let base_pts = now_us.saturating_add(output_delay_us);
        let mut acc = std::mem::replace(&mut self.acc, Accumulator::new());
        acc.feed(samples, base_pts, |frame, pts| self.push_frame(frame, pts));
        self.acc = acc;
    }

    fn try_read_frame(&mut self, now_us: u64) -> Option<ReferenceFrame> {
        if !self.session.active {
            return None;
        }

        if !self.session.is_released(now_us) {
            self.gated_reads += 1;
            if self.gated_reads % 100 == 1 {
                debug!(
                    "AEC: waiting for output delay ({}us remaining)",
                    self.session
                        .start_us
                        .saturating_add(self.session.output_delay_us)
                        .saturating_sub(now_us)
                );
            }
            return None;
        }

        if self.len == 0 {
            self.underflows += 1;
            self.session.underflows += 1;
            return None;
        }

        let slot = &mut self.slots[self.head];
        if !slot.valid {
            // Head slot invalidated underneath us; treat as empty
            self.underflows += 1;
            self.session.underflows += 1;
            return None;
        }
        slot.valid = false;
        let frame = slot.frame;
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;

        self.frames_matched += 1;
        self.session.matched += 1;
        if let Some(pts) = frame.pts_us {
            let drift = now_us as f64 - pts as f64;
            self.avg_drift_us = self.avg_drift_us * 0.9 + drift as f32 * 0.1;
        }

        Some(frame)
    }

    fn start_session(&mut self, now_us: u64, output_delay_us: u64) {
        if self.session.active {
            debug!("AEC: session already active, ignoring start");
            return;
        }
        self.session.start(now_us, output_delay_us);
    }

    fn stop_session(&mut self, now_us: u64) -> Option<SessionSummary> {
        if !self.session.active {
            return None;
        }
        let discarded = self.drop_queued();
        self.session.stop(now_us, discarded)
    }

    fn is_session_active(&self) -> bool {
        self.session.active
    }

    fn clear(&mut self) {
        self.drop_queued();
        self.session = PlaybackSession::default();
        self.frames_written = 0;
        self.frames_matched = 0;
        self.overflows = 0;
        self.underflows = 0;
        self.gated_reads = 0;
        self.avg_drift_us = 0.0;
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            queued_frames: self.len,
            capacity_frames: self.capacity(),
            frames_written: self.frames_written,
            frames_matched: self.frames_matched,
            overflows: self.overflows,
            underflows: self.underflows,
            gated_reads: self.gated_reads,
            avg_drift_us: self.avg_drift_us,
            playback_active: self.session.active,
        }
    }

    fn estimated_delay_ms(&self) -> u32 {
        if self.session.active {
            (self.session.output_delay_us / 1000).min(u32::MAX as u64) as u32
        } else {
            0
        }
    }
}
