//! Notifiers and the end-of-cycle flush.
//!
//! A notifier is attached to one parameter and runs once per flush for every
//! cycle in which that parameter was Dirty. Registration returns a
//! [`NotifierId`] token used for removal.

use core::fmt;

use tracing::trace;

use crate::error::{IoError, Result};
use crate::registry::Io;
use crate::state::{ParamId, ParamState};

/// Token returned by [`Io::add_notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifierId(u64);

impl fmt::Display for NotifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Application callback. Receives the parameter that was dirty.
pub type NotifyFn = Box<dyn FnMut(&mut Io, ParamId)>;

pub(crate) enum NotifyAction {
    Callback(NotifyFn),
    /// Forward to the backend of another parameter.
    Backend(ParamId),
}

pub(crate) struct Notifier {
    pub(crate) id: NotifierId,
    pub(crate) action: NotifyAction,
}

#[derive(Default)]
pub(crate) struct NotifyState {
    next_id: u64,
    flushing: bool,
    /// Parameters dirtied while notifiers ran; they stay Dirty for the next
    /// cycle.
    redirty: Vec<ParamId>,
    /// Notifiers of the parameter currently being dispatched.
    inflight: Vec<NotifierId>,
    removed: Vec<NotifierId>,
}

impl NotifyState {
    pub(crate) fn note_dirty(&mut self, id: ParamId) {
        if self.flushing {
            self.redirty.push(id);
        }
    }
}

impl Io {
    /// Attach `callback` to `id`. Callbacks on one parameter run in
    /// registration order.
    pub fn add_notifier(
        &mut self,
        id: ParamId,
        callback: impl FnMut(&mut Io, ParamId) + 'static,
    ) -> Result<NotifierId> {
        self.attach(id, NotifyAction::Callback(Box::new(callback)))
    }

    /// Detach a notifier. Safe to call from inside a running notifier.
    pub fn remove_notifier(&mut self, id: ParamId, notifier: NotifierId) -> Result<()> {
        let param = self.table.get_mut(id).ok_or(IoError::NoDevice(id))?;
        if let Some(pos) = param.notifiers.iter().position(|n| n.id == notifier) {
            param.notifiers.remove(pos);
            return Ok(());
        }
        if self.notify.inflight.contains(&notifier) && !self.notify.removed.contains(&notifier) {
            self.notify.removed.push(notifier);
            return Ok(());
        }
        Err(IoError::NotFound {
            param: id,
            notifier,
        })
    }

    /// Route dirty cycles of `source` to the backend of `owner`.
    pub(crate) fn link_notifier(&mut self, source: ParamId, owner: ParamId) -> Result<NotifierId> {
        self.attach(source, NotifyAction::Backend(owner))
    }

    /// Drop every link whose owner is `owner`.
    pub(crate) fn unlink_owner(&mut self, owner: ParamId) {
        for param in self.table.iter_mut() {
            param
                .notifiers
                .retain(|n| !matches!(n.action, NotifyAction::Backend(o) if o == owner));
        }
    }

    fn attach(&mut self, id: ParamId, action: NotifyAction) -> Result<NotifierId> {
        let param = self.table.get_mut(id).ok_or(IoError::NoDevice(id))?;
        self.notify.next_id += 1;
        let token = NotifierId(self.notify.next_id);
        param.notifiers.push(Notifier { id: token, action });
        Ok(token)
    }

    /// End one cycle.
    ///
    /// Order: (a) netio transmits pending outbound changes, (b) notifiers run
    /// for every parameter dirty at entry, (c) Dirty is cleared. Parameters
    /// dirtied during (b) keep Dirty into the next cycle. Long-press
    /// detectors then advance their edge snapshot. Nested calls from inside a
    /// notifier are ignored.
    pub fn flush(&mut self) {
        if self.notify.flushing {
            return;
        }
        self.netio_sync();

        let dirty: Vec<ParamId> = self
            .table
            .ids()
            .filter(|id| {
                self.table
                    .get(*id)
                    .is_some_and(|p| p.state.contains(ParamState::DIRTY))
            })
            .collect();

        self.notify.flushing = true;
        for id in &dirty {
            self.run_notifiers(*id);
        }
        self.notify.flushing = false;

        for param in self.table.iter_mut() {
            param.state.remove(ParamState::DIRTY);
        }
        let redirty = std::mem::take(&mut self.notify.redirty);
        for id in redirty {
            if let Some(param) = self.table.get_mut(id) {
                param.state.insert(ParamState::DIRTY);
            }
        }
        trace!(target: "iopar.registry", dirty = dirty.len(), "flush");

        self.longdet_flush();
    }

    fn run_notifiers(&mut self, id: ParamId) {
        let mut list = match self.table.get_mut(id) {
            Some(param) if !param.notifiers.is_empty() => std::mem::take(&mut param.notifiers),
            _ => return,
        };
        self.notify.inflight = list.iter().map(|n| n.id).collect();
        self.notify.removed.clear();

        for notifier in &mut list {
            if self.notify.removed.contains(&notifier.id) || !self.table.contains(id) {
                continue;
            }
            match &mut notifier.action {
                NotifyAction::Callback(callback) => callback(self, id),
                NotifyAction::Backend(owner) => {
                    let owner = *owner;
                    self.with_backend(owner, |backend, io| backend.notified(io, owner, id));
                }
            }
        }

        let removed = std::mem::take(&mut self.notify.removed);
        self.notify.inflight.clear();
        if let Some(param) = self.table.get_mut(id) {
            if param.dying {
                return;
            }
            list.retain(|n| !removed.contains(&n.id));
            // Keep notifiers registered during dispatch after the old ones.
            list.append(&mut param.notifiers);
            param.notifiers = list;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn io_with_bit() -> (Io, ParamId) {
        let mut io = Io::builder().manual_clock().build();
        let id = io.create("virtual:0").unwrap();
        io.flush();
        (io, id)
    }

    #[test]
    fn notifiers_run_in_registration_order() {
        let (mut io, id) = io_with_bit();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Rc::clone(&seen);
            io.add_notifier(id, move |_, _| seen.borrow_mut().push(tag)).unwrap();
        }
        io.set(id, 1.0).unwrap();
        io.flush();
        assert_eq!(*seen.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn notifier_sees_dirty_bit() {
        let (mut io, id) = io_with_bit();
        let observed = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&observed);
        io.add_notifier(id, move |io, p| *sink.borrow_mut() = io.is_dirty(p).ok())
            .unwrap();
        io.set(id, 1.0).unwrap();
        io.flush();
        assert_eq!(*observed.borrow(), Some(true));
        assert!(!io.is_dirty(id).unwrap());
    }

    #[test]
    fn remove_unknown_notifier_fails() {
        let (mut io, id) = io_with_bit();
        let token = io.add_notifier(id, |_, _| {}).unwrap();
        io.remove_notifier(id, token).unwrap();
        assert!(matches!(
            io.remove_notifier(id, token),
            Err(IoError::NotFound { .. })
        ));
    }

    #[test]
    fn notifier_may_remove_itself() {
        let (mut io, id) = io_with_bit();
        let count = Rc::new(RefCell::new(0));
        let token = Rc::new(RefCell::new(None));
        let (c, t) = (Rc::clone(&count), Rc::clone(&token));
        let registered = io
            .add_notifier(id, move |io, p| {
                *c.borrow_mut() += 1;
                if let Some(me) = *t.borrow() {
                    io.remove_notifier(p, me).unwrap();
                }
            })
            .unwrap();
        *token.borrow_mut() = Some(registered);

        io.set(id, 1.0).unwrap();
        io.flush();
        io.set(id, 0.0).unwrap();
        io.flush();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn write_inside_notifier_stays_dirty_for_next_cycle() {
        let mut io = Io::builder().manual_clock().build();
        let a = io.create("virtual:0").unwrap();
        let b = io.create("virtual:1").unwrap();
        io.flush();
        io.add_notifier(a, move |io, _| {
            io.set(b, 1.0).unwrap();
        })
        .unwrap();

        io.set(a, 1.0).unwrap();
        io.flush();
        assert!(io.is_dirty(b).unwrap(), "b changed after the cycle observed it");
        io.flush();
        assert!(!io.is_dirty(b).unwrap());
    }
}
