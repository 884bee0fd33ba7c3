//! Monotonic clocks.

use core::time::Duration;
use std::cell::Cell;
use std::rc::Rc;

/// Source of monotonic time, measured from an arbitrary epoch.
pub trait Clock {
    /// Time elapsed since the clock's epoch.
    fn now(&self) -> Duration;
}

// ── Monotonic ────────────────────────────────────────────────────────────

/// Monotonic clock backed by `std::time::Instant`.
pub struct MonoClock {
    epoch: std::time::Instant,
}

impl MonoClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonoClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

// ── Manual ───────────────────────────────────────────────────────────────

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle while the
/// registry owns another.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `step`.
    pub fn advance(&self, step: Duration) {
        self.now.set(self.now.get().saturating_add(step));
    }

    /// Jump to an absolute time. Going backwards is ignored.
    pub fn set(&self, at: Duration) {
        if at > self.now.get() {
            self.now.set(at);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}
