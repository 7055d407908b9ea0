//! Per-actor monotonic timestamps.
//!
//! Operations carry wall-clock milliseconds, but two calls within the same
//! millisecond (or a clock stepping backwards) must still yield strictly
//! increasing values for one actor. The clock also absorbs remote timestamps
//! so that local writes issued after observing a remote write order after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Thread-safe monotonic millisecond clock.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: `max(wall clock, last + 1)`.
    pub fn tick(&self) -> u64 {
        let wall = now_millis();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(current + 1);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Last issued value without advancing.
    pub fn peek(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Fold in a timestamp observed from a peer.
    pub fn observe(&self, remote: u64) {
        self.last.fetch_max(remote, Ordering::SeqCst);
    }
}
