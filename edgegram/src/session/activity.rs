//! Lossy activity tracking for the idle timer.
//!
//! The signal channel has capacity one and producers drop when it is
//! full. Losing wake-ups is fine: the idle deadline only needs
//! approximate freshness, and the timestamp below stays exact.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::time::Instant;

pub(crate) struct ActivityTracker {
    last_active: Mutex<Instant>,
    signal: mpsc::Sender<()>,
}

impl ActivityTracker {
    pub(crate) fn new() -> (Self, mpsc::Receiver<()>) {
        let (signal, rx) = mpsc::channel(1);
        let tracker = Self {
            last_active: Mutex::new(Instant::now()),
            signal,
        };
        (tracker, rx)
    }

    /// Records activity now. The timestamp never moves backwards.
    pub(crate) fn update(&self) {
        let now = Instant::now();
        let mut last = self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if now > *last {
            *last = now;
        }
        drop(last);
        let _ = self.signal.try_send(());
    }

    pub(crate) fn last_active(&self) -> Instant {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_active_is_monotonic() {
        let (tracker, _rx) = ActivityTracker::new();
        let mut prev = tracker.last_active();
        for _ in 0..64 {
            tracker.update();
            let now = tracker.last_active();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[tokio::test]
    async fn signals_are_lossy_not_blocking() {
        let (tracker, mut rx) = ActivityTracker::new();
        // Nobody draining: updates must not block or error.
        for _ in 0..16 {
            tracker.update();
        }
        // Exactly one buffered signal survives.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
