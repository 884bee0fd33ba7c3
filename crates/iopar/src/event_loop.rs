//! Reactor glue: tagged timer and fd targets owned by the registry.
//!
//! Timers never carry closures into parameter state. A target names what to
//! call back, and dispatch looks the owner up again when the timer fires, so
//! a destroyed owner simply no longer answers.

use core::time::Duration;
use std::os::fd::BorrowedFd;

use iopar_reactor::{TimerHandle, wait_readable};
use tracing::trace;

use crate::actuators::motor::MotorId;
use crate::backends::input::DeviceKey;
use crate::error::Result;
use crate::longdet::LongDetId;
use crate::netio::{RemoteId, SocketKey};
use crate::registry::Io;
use crate::state::ParamId;

pub(crate) type AppTimer = Box<dyn FnOnce(&mut Io)>;

/// Shortest period of a repeating timer; a zero period would never let
/// `fire_timers` catch up with the clock.
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTarget {
    /// Routed to the parameter backend's `timer` hook.
    Param { id: ParamId, tag: u32 },
    Motor(MotorId),
    Keepalive,
    RemoteLost { socket: SocketKey, remote: RemoteId },
    LongPress(LongDetId),
    Debounce { device: DeviceKey, id: ParamId },
    App(u64),
}

impl TimerTarget {
    fn owned_by(&self, param: ParamId) -> bool {
        match *self {
            Self::Param { id, .. } | Self::Debounce { id, .. } => id == param,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FdTarget {
    Socket(SocketKey),
    InputDevice(DeviceKey),
}

impl Io {
    /// Current time on the registry clock.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    #[must_use]
    pub fn now_secs(&self) -> f64 {
        self.clock.now().as_secs_f64()
    }

    /// Run `callback` once after `delay`.
    pub fn add_timeout(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut Io) + 'static,
    ) -> TimerHandle {
        self.next_app_timer += 1;
        let key = self.next_app_timer;
        self.app_timers.insert(key, Box::new(callback));
        self.schedule(delay, TimerTarget::App(key))
    }

    /// Cancel a timeout from [`Io::add_timeout`]. Returns `false` when it
    /// already ran.
    pub fn cancel_timeout(&mut self, handle: TimerHandle) -> bool {
        match self.timers.remove(handle) {
            Some(TimerTarget::App(key)) => {
                self.app_timers.remove(&key);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    pub(crate) fn schedule(&mut self, delay: Duration, target: TimerTarget) -> TimerHandle {
        let deadline = self.now().saturating_add(delay);
        self.timers.schedule_at(deadline, target)
    }

    /// Schedule relative to the deadline of the timer being dispatched, so
    /// periodic work does not drift. Outside dispatch this is `schedule`.
    /// Periods shorter than [`MIN_PERIOD`] are stretched to it.
    pub(crate) fn schedule_repeat(&mut self, delay: Duration, target: TimerTarget) -> TimerHandle {
        let now = self.now();
        let base = self.firing.unwrap_or(now);
        let deadline = base.saturating_add(delay.max(MIN_PERIOD)).max(now);
        self.timers.schedule_at(deadline, target)
    }

    pub(crate) fn reschedule(
        &mut self,
        slot: &mut Option<TimerHandle>,
        delay: Duration,
        target: TimerTarget,
    ) {
        let deadline = self.now().saturating_add(delay);
        self.timers.reschedule(slot, deadline, target);
    }

    pub(crate) fn schedule_param(&mut self, id: ParamId, delay: Duration, tag: u32) -> TimerHandle {
        self.schedule(delay, TimerTarget::Param { id, tag })
    }

    pub(crate) fn repeat_param(&mut self, id: ParamId, delay: Duration, tag: u32) -> TimerHandle {
        self.schedule_repeat(delay, TimerTarget::Param { id, tag })
    }

    pub(crate) fn cancel_timer(&mut self, handle: Option<TimerHandle>) {
        if let Some(handle) = handle {
            self.timers.cancel(handle);
        }
    }

    pub(crate) fn cancel_param_timers(&mut self, id: ParamId) {
        self.timers.cancel_where(|target| target.owned_by(id));
    }

    pub(crate) fn watch_fd(&mut self, target: FdTarget) {
        if !self.fd_watches.contains(&target) {
            self.fd_watches.push(target);
        }
    }

    pub(crate) fn unwatch_fd(&mut self, target: FdTarget) {
        self.fd_watches.retain(|t| *t != target);
    }

    /// Fire every timer whose deadline has passed, earliest first.
    pub fn fire_timers(&mut self) {
        let now = self.now();
        while let Some(expired) = self.timers.pop_expired(now) {
            self.firing = Some(expired.deadline);
            self.dispatch_timer(expired.target);
            self.firing = None;
        }
    }

    fn dispatch_timer(&mut self, target: TimerTarget) {
        trace!(target: "iopar.loop", ?target, "timer");
        match target {
            TimerTarget::Param { id, tag } => {
                self.with_backend(id, |backend, io| backend.timer(io, id, tag));
            }
            TimerTarget::Motor(motor) => self.motor_step(motor),
            TimerTarget::Keepalive => self.netio_keepalive(),
            TimerTarget::RemoteLost { socket, remote } => self.netio_remote_lost(socket, remote),
            TimerTarget::LongPress(det) => self.longdet_expired(det),
            TimerTarget::Debounce { device, id } => self.input_debounced(device, id),
            TimerTarget::App(key) => {
                if let Some(callback) = self.app_timers.remove(&key) {
                    callback(self);
                }
            }
        }
    }

    fn fd_of(&self, target: FdTarget) -> Option<BorrowedFd<'_>> {
        match target {
            FdTarget::Socket(key) => self.netio.socket_fd(key),
            FdTarget::InputDevice(key) => self.inputs.device_fd(key),
        }
    }

    fn dispatch_fd(&mut self, target: FdTarget) {
        match target {
            FdTarget::Socket(key) => self.netio_readable(key),
            FdTarget::InputDevice(key) => self.input_readable(key),
        }
    }

    /// One reactor iteration: fire due timers, wait for a watched fd or the
    /// next deadline (bounded by `max_wait`), dispatch readable fds, fire
    /// timers again. `None` with nothing scheduled waits forever.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        self.fire_timers();

        let mut timeout = self.timers.time_to_next(self.now());
        if let Some(max) = max_wait {
            timeout = Some(timeout.map_or(max, |t| t.min(max)));
        }

        let targets = self.fd_watches.clone();
        let ready: Vec<FdTarget> = {
            let mut watched = Vec::with_capacity(targets.len());
            let mut fds = Vec::with_capacity(targets.len());
            for target in &targets {
                if let Some(fd) = self.fd_of(*target) {
                    watched.push(*target);
                    fds.push(fd);
                }
            }
            wait_readable(&fds, timeout)?
                .into_iter()
                .map(|idx| watched[idx])
                .collect()
        };
        for target in ready {
            self.dispatch_fd(target);
        }

        self.fire_timers();
        Ok(())
    }

    /// `run_once` followed by `flush`: one application cycle.
    pub fn cycle(&mut self, max_wait: Option<Duration>) -> Result<()> {
        self.run_once(max_wait)?;
        self.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iopar_reactor::ManualClock;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn app_timeout_fires_once_at_deadline() {
        let clock = ManualClock::new();
        let mut io = Io::builder().clock(clock.clone()).build();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        io.add_timeout(Duration::from_millis(300), move |_| h.set(h.get() + 1));

        clock.advance(Duration::from_millis(299));
        io.fire_timers();
        assert_eq!(hits.get(), 0);
        clock.advance(Duration::from_millis(1));
        io.fire_timers();
        io.fire_timers();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn cancelled_timeout_never_runs() {
        let clock = ManualClock::new();
        let mut io = Io::builder().clock(clock.clone()).build();
        let hit = Rc::new(Cell::new(false));
        let h = Rc::clone(&hit);
        let handle = io.add_timeout(Duration::from_millis(10), move |_| h.set(true));
        assert!(io.cancel_timeout(handle));
        clock.advance(Duration::from_secs(1));
        io.fire_timers();
        assert!(!hit.get());
        assert!(!io.cancel_timeout(handle));
    }

    #[test]
    fn run_once_returns_after_max_wait() {
        let mut io = Io::builder().manual_clock().build();
        io.run_once(Some(Duration::from_millis(1))).unwrap();
    }
}
