use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter bumped whenever queued or in-flight playback audio is
/// invalidated (playback stop, reset).
///
/// A playback thread that writes to hardware outside any lock takes a
/// [`token`](Self::token) before the write and checks
/// [`is_current`](Self::is_current) after it. A mismatch means the audio it
/// just wrote was discarded in the meantime and must not be reported as played.
#[derive(Debug, Default)]
pub struct DiscardSequence {
    seq: AtomicU64,
}

impl DiscardSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.seq.load(Ordering::Acquire) == token
    }

    /// Invalidates all outstanding tokens. Returns the new value.
    pub fn discard(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_token_survives_without_discard() {
        let seq = DiscardSequence::new();
        let token = seq.token();
        assert!(seq.is_current(token));
    }

    #[test]
    fn test_discard_invalidates_token() {
        let seq = DiscardSequence::new();
        let token = seq.token();
        assert_eq!(seq.discard(), token + 1);
        assert!(!seq.is_current(token));
        assert!(seq.is_current(seq.token()));
    }

    #[test]
    fn test_concurrent_discards_never_missed() {
        let seq = Arc::new(DiscardSequence::new());
        let go = Arc::new(AtomicBool::new(false));

        for round in 0..200 {
            let token = seq.token();
            let discard = round % 2 == 0;

            let handle = {
                let seq = Arc::clone(&seq);
                let go = Arc::clone(&go);
                thread::spawn(move || {
                    while !go.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    if discard {
                        seq.discard();
                    }
                })
            };

            // Simulated blocking hardware write
            go.store(true, Ordering::Release);
            handle.join().unwrap();
            go.store(false, Ordering::Release);

            assert_eq!(seq.is_current(token), !discard, "round {}", round);
        }
    }
}
