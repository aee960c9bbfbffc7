use super::{Accumulator, FrameStore, PlaybackSession, ReferenceFrame, SessionSummary, StoreStats};
use crate::constants::{FRAME_SIZE, SAMPLE_RATE};
use log::{debug, warn};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Sample FIFO. Frames are handed out as soon as a whole one is queued;
/// the echo delay is whatever the buffer holds.
pub struct FillLevelStore {
    ring: HeapRb<i16>,
    acc: Accumulator,
    session: PlaybackSession,
    capacity_frames: usize,
    frames_written: u64,
    frames_matched: u64,
    overflows: u64,
    underflows: u64,
}

impl FillLevelStore {
    pub fn new(capacity_frames: usize) -> Self {
        let capacity_frames = capacity_frames.max(1);
        Self {
            ring: HeapRb::<i16>::new(capacity_frames * FRAME_SIZE),
            acc: Accumulator::new(),
            session: PlaybackSession::default(),
            capacity_frames,
            frames_written: 0,
            frames_matched: 0,
            overflows: 0,
            underflows: 0,
        }
    }

    fn push_frame(&mut self, frame: &[i16; FRAME_SIZE]) {
        if self.ring.vacant_len() < FRAME_SIZE {
            // Ring head is always frame aligned, so this drops exactly the oldest frame
            self.ring.skip(FRAME_SIZE);
            self.overflows += 1;
            self.session.overflows += 1;
            if self.overflows == 1 || self.overflows % 100 == 0 {
                warn!("AEC: reference overflow, dropped oldest frame (total={})", self.overflows);
            }
        }
        self.ring.push_slice(frame);
        self.frames_written += 1;
    }
}

impl FrameStore for FillLevelStore {
    fn write(&mut self, samples: &[i16], now_us: u64, output_delay_us: u64) {
        if !self.session.active {
            self.session.start(now_us, output_delay_us);
        }

        // Borrow the accumulator separately from the ring
        let mut acc = std::mem::replace(&mut self.acc, Accumulator::new());
        acc.feed(samples, now_us, |frame, _| self.push_frame(frame));
        self.acc = acc;
    }

    fn try_read_frame(&mut self, _now_us: u64) -> Option<ReferenceFrame> {
        if self.ring.occupied_len() < FRAME_SIZE {
            if self.session.active {
                self.underflows += 1;
                self.session.underflows += 1;
            }
            return None;
        }

        let mut frame = ReferenceFrame::silent();
        self.ring.pop_slice(&mut frame.samples);
        self.frames_matched += 1;
        self.session.matched += 1;
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
        let discarded = self.ring.occupied_len() / FRAME_SIZE;
        self.ring.clear();
        self.acc.clear();
        self.session.stop(now_us, discarded)
    }

    fn is_session_active(&self) -> bool {
        self.session.active
    }

    fn clear(&mut self) {
        self.ring.clear();
        self.acc.clear();
        self.session = PlaybackSession::default();
        self.frames_written = 0;
        self.frames_matched = 0;
        self.overflows = 0;
        self.underflows = 0;
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            queued_frames: self.ring.occupied_len() / FRAME_SIZE,
            capacity_frames: self.capacity_frames,
            frames_written: self.frames_written,
            frames_matched: self.frames_matched,
            overflows: self.overflows,
            underflows: self.underflows,
            gated_reads: 0,
            avg_drift_us: 0.0,
            playback_active: self.session.active,
        }
    }

    fn estimated_delay_ms(&self) -> u32 {
        let queued = self.ring.occupied_len() + self.acc.pending();
        (queued as u64 * 1000 / SAMPLE_RATE as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(value: i16) -> Vec<i16> {
        vec![value; FRAME_SIZE]
    }

    #[test]
    fn test_fifo_order() {
        let mut store = FillLevelStore::new(10);
        for v in 1..=3 {
            store.write(&frame_of(v), 0, 0);
        }
        for v in 1..=3 {
            assert_eq!(store.try_read_frame(0).unwrap().samples[0], v);
        }
        assert!(store.try_read_frame(0).is_none());
    }

    #[test]
    fn test_overflow_drops_oldest_frame() {
        let mut store = FillLevelStore::new(2);
        for v in 1..=3 {
            store.write(&frame_of(v), 0, 0);
        }
        let stats = store.stats();
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.queued_frames, 2);
        assert_eq!(store.try_read_frame(0).unwrap().samples[0], 2);
        assert_eq!(store.try_read_frame(0).unwrap().samples[0], 3);
    }

    #[test]
    fn test_partial_write_is_not_readable() {
        let mut store = FillLevelStore::new(4);
        store.write(&[5; 300], 0, 0);
        assert!(store.try_read_frame(0).is_none());
        store.write(&[5; 180], 0, 0);
        assert!(store.try_read_frame(0).is_some());
    }

    #[test]
    fn test_underflow_only_counted_in_session() {
        let mut store = FillLevelStore::new(4);
        assert!(store.try_read_frame(0).is_none());
        assert_eq!(store.stats().underflows, 0);

        store.write(&frame_of(1), 0, 0);
        store.try_read_frame(0);
        assert!(store.try_read_frame(0).is_none());
        assert_eq!(store.stats().underflows, 1);
    }

    #[test]
    fn test_estimated_delay_from_occupancy() {
        let mut store = FillLevelStore::new(10);
        store.write(&[0; FRAME_SIZE * 5], 0, 0);
        assert_eq!(store.estimated_delay_ms(), 50);
    }

    #[test]
    fn test_stop_session_discards_queued_frames() {
        let mut store = FillLevelStore::new(10);
        store.write(&[0; FRAME_SIZE * 3 + 10], 0, 0);
        store.try_read_frame(0);

        let summary = store.stop_session(20_000).unwrap();
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.discarded_frames, 2);
        assert!(!store.is_session_active());
        assert_eq!(store.stats().queued_frames, 0);
        assert_eq!(store.estimated_delay_ms(), 0);
    }

    #[test]
    fn test_clear_resets_counters() {
        let mut store = FillLevelStore::new(1);
        store.write(&[0; FRAME_SIZE * 3], 0, 0);
        store.clear();
        let stats = store.stats();
        assert_eq!(stats, StoreStats { capacity_frames: 1, ..StoreStats::default() });
    }
}
