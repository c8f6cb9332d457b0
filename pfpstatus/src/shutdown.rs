//! Cooperative cancellation shared by the background loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity at which [`Shutdown::sleep`] re-checks the signal.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cancellation signal checked by the collect, dump and serve loops.
///
/// Cloning is cheap and every clone observes the same signal. Nothing is
/// interrupted forcibly: loops check [`Shutdown::is_cancelled`] between units
/// of work.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    cancelled: Arc<AtomicBool>,
}

impl Shutdown {
    /// Creates a signal that is not cancelled yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`Shutdown::cancel`] was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` or until cancelled, whichever comes first.
    ///
    /// Returns true if the full duration elapsed without cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
