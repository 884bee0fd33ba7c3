#![forbid(unsafe_code)]

//! Reactor primitives for iopar.
//!
//! The iopar runtime is strictly single-threaded: one loop blocks in
//! [`wait_readable`] on the union of registered descriptors and the nearest
//! timer deadline, then runs every handler to completion. This crate holds the
//! pieces of that loop that carry no parameter semantics:
//!
//! - [`Clock`] - monotonic time source ([`MonoClock`], [`ManualClock`])
//! - [`TimerQueue`] - one-shot timers identified by [`TimerHandle`]
//! - [`wait_readable`] - the single blocking point
//!
//! Repeating timers are modelled as one-shot timers that re-arm themselves
//! from their own deadline, so a handler that runs late does not drift.

pub mod clock;
pub mod timer;
#[cfg(unix)]
pub mod wait;

pub use clock::{Clock, ManualClock, MonoClock};
pub use timer::{Expired, TimerHandle, TimerQueue};
#[cfg(unix)]
pub use wait::wait_readable;

/// Convert fractional seconds (the unit used in spec strings and config
/// files) into a [`core::time::Duration`], saturating negatives and NaN to
/// zero.
#[must_use]
pub fn secs(value: f64) -> core::time::Duration {
    if value.is_nan() || value <= 0.0 {
        return core::time::Duration::ZERO;
    }
    core::time::Duration::try_from_secs_f64(value).unwrap_or(core::time::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn secs_handles_fractions() {
        assert_eq!(secs(0.2), Duration::from_millis(200));
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn secs_saturates_bad_input() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
    }
}
