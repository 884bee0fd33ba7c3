//! Long-press detection on a boolean input.
//!
//! Feed the input with [`Io::set_longdet`] and read [`Io::longdet_state`] /
//! [`Io::longdet_edge`] in the same cycle. A release before the delay is a
//! short press, which lasts one cycle. Holding past the delay is a long
//! press, which lasts until the release and suppresses the short press.

use core::time::Duration;

use iopar_reactor::{TimerHandle, secs};
use tracing::trace;

use crate::event_loop::TimerTarget;
use crate::registry::Io;
use crate::state::to_bool;

/// Handle of a long-press detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LongDetId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Press {
    #[default]
    None,
    Short,
    Long,
}

struct Detector {
    id: LongDetId,
    value: Press,
    /// Value at the previous flush.
    old: Press,
    pressed: bool,
    delay: Duration,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
pub(crate) struct LongDetectors {
    next: u32,
    list: Vec<Detector>,
}

impl LongDetectors {
    fn get(&self, id: LongDetId) -> Option<&Detector> {
        self.list.iter().find(|d| d.id == id)
    }

    fn get_mut(&mut self, id: LongDetId) -> Option<&mut Detector> {
        self.list.iter_mut().find(|d| d.id == id)
    }
}

impl Io {
    /// New detector with the default delay: the `longpress` const when it
    /// is set, else the tuned delay.
    pub fn new_longdet(&mut self) -> LongDetId {
        let mut delay = self.const_number("longpress");
        if !(delay >= 0.0) {
            delay = self.tuning.longpress.delay_secs;
        }
        self.new_longdet_with(secs(delay))
    }

    pub fn new_longdet_with(&mut self, delay: Duration) -> LongDetId {
        self.longdets.next += 1;
        let id = LongDetId(self.longdets.next);
        self.longdets.list.push(Detector {
            id,
            value: Press::None,
            old: Press::None,
            pressed: false,
            delay,
            timer: None,
        });
        id
    }

    /// Feed the input. Values `>= 0.5` are pressed.
    pub fn set_longdet(&mut self, id: LongDetId, value: f64) {
        let pressed = to_bool(value);
        let Some(det) = self.longdets.get_mut(id) else {
            return;
        };
        if det.pressed == pressed {
            return;
        }
        det.pressed = pressed;
        if pressed {
            let delay = det.delay;
            let mut slot = det.timer.take();
            self.reschedule(&mut slot, delay, TimerTarget::LongPress(id));
            if let Some(det) = self.longdets.get_mut(id) {
                det.timer = slot;
            }
            return;
        }
        let timer = det.timer.take();
        det.value = match det.value {
            Press::Long => Press::None,
            _ => Press::Short,
        };
        self.cancel_timer(timer);
    }

    #[must_use]
    pub fn longdet_state(&self, id: LongDetId) -> Press {
        self.longdets.get(id).map_or(Press::None, |d| d.value)
    }

    /// Whether the state differs from the one seen at the last flush.
    #[must_use]
    pub fn longdet_edge(&self, id: LongDetId) -> bool {
        self.longdets.get(id).is_some_and(|d| d.value != d.old)
    }

    pub fn remove_longdet(&mut self, id: LongDetId) {
        if let Some(at) = self.longdets.list.iter().position(|d| d.id == id) {
            let det = self.longdets.list.remove(at);
            self.cancel_timer(det.timer);
        }
    }

    pub(crate) fn longdet_expired(&mut self, id: LongDetId) {
        if let Some(det) = self.longdets.get_mut(id) {
            det.timer = None;
            det.value = Press::Long;
            trace!(target: "iopar.longdet", ?id, "long press");
        }
    }

    pub(crate) fn longdet_flush(&mut self) {
        for det in &mut self.longdets.list {
            det.old = det.value;
            // A short press has no release of its own.
            if det.value == Press::Short {
                det.value = Press::None;
            }
        }
    }
}
