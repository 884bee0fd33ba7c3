//! Capability interface implemented by every parameter type.

use crate::error::{IoError, Result};
use crate::registry::Io;
use crate::state::ParamId;

/// Type-specific behavior behind a parameter.
///
/// The registry takes the backend out of its slot while a hook runs, so hooks
/// receive the whole [`Io`] and may freely touch other parameters, timers and
/// sockets. Every hook gets the id of the parameter it serves.
pub(crate) trait Backend {
    /// Whether [`Backend::write`] is supported at all.
    fn can_write(&self) -> bool {
        false
    }

    /// Apply a new value. On success the registry decides about Dirty by
    /// comparing the stored value before and after.
    fn write(&mut self, _io: &mut Io, id: ParamId, _value: f64) -> Result<()> {
        Err(IoError::NotSupported(id))
    }

    /// Just-in-time recompute before every read.
    fn refresh(&mut self, _io: &mut Io, _id: ParamId) {}

    /// A timer scheduled with [`Io::schedule_param`] expired.
    fn timer(&mut self, _io: &mut Io, _id: ParamId, _tag: u32) {}

    /// A parameter this backend linked itself to became dirty.
    fn notified(&mut self, _io: &mut Io, _id: ParamId, _source: ParamId) {}

    /// Release resources. Runs after notifiers were detached and timers
    /// cancelled, before the slot is freed.
    fn destroy(&mut self, _io: &mut Io, _id: ParamId) {}
}

/// Constructor selected by the spec prefix. Runs after the slot has been
/// reserved, so it may schedule timers against `id`.
pub(crate) type Constructor = fn(&mut Io, ParamId, &str) -> Result<Box<dyn Backend>>;
