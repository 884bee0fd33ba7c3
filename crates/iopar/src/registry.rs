//! The parameter registry.
//!
//! [`Io`] is the owned context behind every operation: the parameter table,
//! the timer queue and fd watches of the reactor, netio sockets, actuator
//! tables, the virtual bit word, long-press detectors, presets and consts.
//! Several `Io` values may coexist; nothing is process-global.
//!
//! # Spec strings
//!
//! `create` accepts `TYPE:BODY` or a bare preset name. A preset resolves to
//! another spec string, so presets may chain (at most ten levels deep).

use core::time::Duration;

use ahash::AHashMap;
use iopar_reactor::{Clock, ManualClock, MonoClock, TimerQueue};
use tracing::{debug, info, trace, warn};

use crate::actuators::motor::{MotorId, Motors};
use crate::actuators::shared::SharedTable;
use crate::actuators::{motor, shared, teleruptor};
use crate::backend::{Backend, Constructor};
use crate::backends::input::{self, InputDevices};
use crate::backends::{led, sysfs, virtual_bit};
use crate::config::{Consts, Presets};
use crate::error::{IoError, Result};
use crate::event_loop::{AppTimer, FdTarget, TimerTarget};
use crate::longdet::LongDetectors;
use crate::netio::{self, Netio};
use crate::notify::NotifyState;
use crate::state::{ParamId, ParamState, same_value};
use crate::table::{Param, ParamTable};
use crate::tuning::Tuning;

const MAX_PRESET_DEPTH: u32 = 10;

/// Constructors by spec prefix. The prefix doubles as the parameter kind.
const CONSTRUCTORS: &[(&str, Constructor)] = &[
    ("virtual", virtual_bit::create),
    ("led", led::create_led),
    ("bled", led::create_bool_led),
    ("backlight", led::create_backlight),
    ("sysfs", sysfs::create),
    ("shared", shared::create),
    ("netio", netio::create_local),
    ("unix", netio::create_unix),
    ("udp4", netio::create_udp4),
    ("udp6", netio::create_udp6),
    ("udp", netio::create_udp4),
    ("dmotor", motor::create_dir),
    ("pmotor", motor::create_pos),
    ("teleruptor", teleruptor::create),
    ("in", input::create),
    ("button", input::create),
    ("kbd", input::create),
];

/// Registry handle.
pub struct Io {
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) tuning: Tuning,
    pub(crate) table: ParamTable,
    next_serial: u64,
    pub(crate) timers: TimerQueue<TimerTarget>,
    pub(crate) fd_watches: Vec<FdTarget>,
    /// Deadline of the timer being dispatched, base for repeating timers.
    pub(crate) firing: Option<Duration>,
    pub(crate) app_timers: AHashMap<u64, AppTimer>,
    pub(crate) next_app_timer: u64,
    pub(crate) notify: NotifyState,
    preset_depth: u32,
    presets: Option<Presets>,
    consts: Option<Consts>,
    pub(crate) virtual_bits: u32,
    pub(crate) netio: Netio,
    pub(crate) motors: Motors,
    /// Motor whose position parameter the next `pmotor:` attaches to.
    pub(crate) pending_pos: Option<MotorId>,
    pub(crate) shared: SharedTable,
    pub(crate) inputs: InputDevices,
    pub(crate) longdets: LongDetectors,
}

/// Builder for [`Io`].
#[derive(Default)]
pub struct IoBuilder {
    clock: Option<Box<dyn Clock>>,
    tuning: Option<Tuning>,
    presets: Option<Presets>,
    consts: Option<Consts>,
}

impl IoBuilder {
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Use a fresh [`ManualClock`] that nobody else advances.
    #[must_use]
    pub fn manual_clock(self) -> Self {
        self.clock(ManualClock::new())
    }

    #[must_use]
    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = Some(tuning);
        self
    }

    /// Use this preset table instead of loading the default files.
    #[must_use]
    pub fn presets(mut self, presets: Presets) -> Self {
        self.presets = Some(presets);
        self
    }

    /// Use this const table instead of loading the default files.
    #[must_use]
    pub fn consts(mut self, consts: Consts) -> Self {
        self.consts = Some(consts);
        self
    }

    /// Build the registry. Out-of-range tuning is logged, not rejected;
    /// [`Tuning::load_validated`] is the strict path.
    #[must_use]
    pub fn build(self) -> Io {
        let tuning = self.tuning.unwrap_or_default();
        for problem in tuning.validate() {
            warn!(target: "iopar", %problem, "questionable tuning");
        }
        Io {
            clock: self.clock.unwrap_or_else(|| Box::new(MonoClock::new())),
            tuning,
            table: ParamTable::new(),
            next_serial: 0,
            timers: TimerQueue::new(),
            fd_watches: Vec::new(),
            firing: None,
            app_timers: AHashMap::new(),
            next_app_timer: 0,
            notify: NotifyState::default(),
            preset_depth: 0,
            presets: self.presets,
            consts: self.consts,
            virtual_bits: 0,
            netio: Netio::new(std::process::id()),
            motors: Motors::default(),
            pending_pos: None,
            shared: SharedTable::default(),
            inputs: InputDevices::default(),
            longdets: LongDetectors::default(),
        }
    }
}

impl Default for Io {
    fn default() -> Self {
        Self::new()
    }
}

impl Io {
    /// Registry on the monotonic clock with default tuning. Presets and
    /// consts are loaded from the default files on first use.
    #[must_use]
    pub fn new() -> Self {
        IoBuilder::default().build()
    }

    #[must_use]
    pub fn builder() -> IoBuilder {
        IoBuilder::default()
    }

    #[must_use]
    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    // ── construction ─────────────────────────────────────────────────────

    /// Create a parameter from a spec string (`TYPE:BODY` or a preset name).
    pub fn create(&mut self, spec: &str) -> Result<ParamId> {
        let result = self.create_nested(spec);
        if let Err(err) = &result {
            info!(target: "iopar.registry", spec, %err, "cannot create parameter");
        }
        result
    }

    /// Create a parameter with an explicit type prefix.
    pub fn create_typed(&mut self, kind: &str, body: &str) -> Result<ParamId> {
        let result = self.construct(kind, body);
        if let Err(err) = &result {
            info!(target: "iopar.registry", kind, body, %err, "cannot create parameter");
        }
        result
    }

    fn create_nested(&mut self, spec: &str) -> Result<ParamId> {
        match spec.split_once(':') {
            Some((kind, body)) => self.construct(kind, body),
            None => self.create_preset(spec),
        }
    }

    fn create_preset(&mut self, name: &str) -> Result<ParamId> {
        if self.preset_depth >= MAX_PRESET_DEPTH {
            return Err(IoError::construction(
                name,
                format!("presets nested deeper than {MAX_PRESET_DEPTH}"),
            ));
        }
        let Some(target) = self.preset(name) else {
            return Err(IoError::construction(name, "no such preset"));
        };
        self.preset_depth += 1;
        let result = self.create_nested(&target);
        self.preset_depth -= 1;
        let id = result?;
        if let Some(param) = self.table.get_mut(id)
            && param.name.is_none()
        {
            param.name = Some(name.to_owned());
        }
        Ok(id)
    }

    fn construct(&mut self, kind: &str, body: &str) -> Result<ParamId> {
        let Some(&(kind, ctor)) = CONSTRUCTORS.iter().find(|(prefix, _)| *prefix == kind) else {
            return Err(IoError::construction(
                format!("{kind}:{body}"),
                format!("unknown type `{kind}`"),
            ));
        };
        self.next_serial += 1;
        let id = self.table.insert(Param::new(kind, self.next_serial));
        match ctor(self, id, body) {
            Ok(backend) => {
                if let Some(param) = self.table.get_mut(id) {
                    param.backend = Some(backend);
                }
                debug!(target: "iopar.registry", param = %id, kind, body, "created");
                Ok(id)
            }
            Err(err) => {
                self.release_slot(id);
                Err(err)
            }
        }
    }

    /// Destroy a parameter. Unknown ids are ignored.
    ///
    /// Notifiers are detached first, then the type's cleanup runs, then the
    /// slot is freed. Timers owned by the parameter never fire afterwards.
    pub fn destroy(&mut self, id: ParamId) {
        let backend = match self.table.get_mut(id) {
            Some(param) if !param.dying => {
                param.dying = true;
                param.notifiers.clear();
                param.backend.take()
            }
            _ => return,
        };
        self.cancel_param_timers(id);
        if let Some(mut backend) = backend {
            backend.destroy(self, id);
        }
        self.release_slot(id);
        debug!(target: "iopar.registry", param = %id, "destroyed");
    }

    fn release_slot(&mut self, id: ParamId) {
        self.cancel_param_timers(id);
        self.unlink_owner(id);
        self.table.remove(id);
    }

    /// Run `f` on the backend of `id` with the backend taken out of its
    /// slot. Returns `None` for unknown or dying parameters.
    pub(crate) fn with_backend<R>(
        &mut self,
        id: ParamId,
        f: impl FnOnce(&mut dyn Backend, &mut Io) -> R,
    ) -> Option<R> {
        let param = self.table.get_mut(id)?;
        if param.dying {
            return None;
        }
        let serial = param.serial;
        let mut backend = param.backend.take()?;
        let out = f(backend.as_mut(), self);
        let slot = self.table.get(id).map(|p| (p.serial == serial, p.dying));
        match slot {
            Some((true, false)) => {
                if let Some(param) = self.table.get_mut(id) {
                    param.backend = Some(backend);
                }
            }
            // Destroyed from inside its own hook.
            Some((true, true)) | None => backend.destroy(self, id),
            Some((false, _)) => {}
        }
        Some(out)
    }

    // ── values ───────────────────────────────────────────────────────────

    /// Current value, refreshed first for types that compute on read.
    pub fn get(&mut self, id: ParamId) -> Result<f64> {
        if !self.table.contains(id) {
            return Err(IoError::NoDevice(id));
        }
        self.with_backend(id, |backend, io| backend.refresh(io, id));
        Ok(self.value(id))
    }

    /// Like [`Io::get`], with `default` for unknown ids.
    pub fn get_or(&mut self, id: ParamId, default: f64) -> f64 {
        self.get(id).unwrap_or(default)
    }

    /// Write a value. Dirty is raised when the stored value changed.
    pub fn set(&mut self, id: ParamId, value: f64) -> Result<()> {
        let param = self.table.get(id).ok_or(IoError::NoDevice(id))?;
        if !param.backend.as_ref().is_some_and(|b| b.can_write()) {
            return Err(IoError::NotSupported(id));
        }
        let before = param.value;
        self.with_backend(id, |backend, io| backend.write(io, id, value))
            .unwrap_or(Err(IoError::NoDevice(id)))?;
        let after = self.value(id);
        trace!(target: "iopar.registry", param = %id, value, before, after, "set");
        if !same_value(before, after) {
            self.mark_dirty(id);
        }
        Ok(())
    }

    pub fn state(&self, id: ParamId) -> Result<ParamState> {
        self.table
            .get(id)
            .map(|p| p.state)
            .ok_or(IoError::NoDevice(id))
    }

    pub fn is_dirty(&self, id: ParamId) -> Result<bool> {
        Ok(self.state(id)?.contains(ParamState::DIRTY))
    }

    pub fn is_present(&self, id: ParamId) -> Result<bool> {
        Ok(self.state(id)?.contains(ParamState::PRESENT))
    }

    pub fn set_name(&mut self, id: ParamId, name: impl Into<String>) -> Result<()> {
        let param = self.table.get_mut(id).ok_or(IoError::NoDevice(id))?;
        param.name = Some(name.into());
        Ok(())
    }

    #[must_use]
    pub fn name(&self, id: ParamId) -> Option<&str> {
        self.table.get(id)?.name.as_deref()
    }

    /// Type prefix the parameter was created with.
    #[must_use]
    pub fn kind(&self, id: ParamId) -> Option<&'static str> {
        self.table.get(id).map(|p| p.kind)
    }

    /// Input buttons on this parameter raise Dirty only when pressed.
    pub fn set_push_button(&mut self, id: ParamId) -> Result<()> {
        let param = self.table.get_mut(id).ok_or(IoError::NoDevice(id))?;
        param.state.insert(ParamState::PUSH_BUTTON);
        Ok(())
    }

    /// Live parameter ids in ascending order.
    #[must_use]
    pub fn params(&self) -> Vec<ParamId> {
        self.table.ids().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── presets and consts ───────────────────────────────────────────────

    /// Spec string stored under a preset name.
    pub fn preset(&mut self, name: &str) -> Option<String> {
        if self.presets.is_none() {
            self.presets = Some(Presets::load_default(&self.tuning.paths.preset_files));
        }
        self.presets.as_ref()?.get(name).map(str::to_owned)
    }

    /// Numeric const, NaN when missing or not numeric.
    pub fn const_number(&mut self, name: &str) -> f64 {
        self.consts_table().number(name)
    }

    /// Raw text of a const.
    pub fn const_string(&mut self, name: &str) -> Option<String> {
        self.consts_table().string(name).map(str::to_owned)
    }

    fn consts_table(&mut self) -> &Consts {
        let paths = &self.tuning.paths.const_files;
        self.consts.get_or_insert_with(|| Consts::load_default(paths))
    }

    // ── helpers for backends ─────────────────────────────────────────────

    /// Stored value without refresh, NaN for unknown ids.
    pub(crate) fn value(&self, id: ParamId) -> f64 {
        self.table.get(id).map_or(f64::NAN, |p| p.value)
    }

    /// Overwrite the stored value, leaving Dirty alone.
    pub(crate) fn store_raw(&mut self, id: ParamId, value: f64) {
        if let Some(param) = self.table.get_mut(id) {
            param.value = value;
        }
    }

    /// Overwrite the stored value, raising Dirty when it changed.
    pub(crate) fn store(&mut self, id: ParamId, value: f64) {
        let changed = match self.table.get_mut(id) {
            Some(param) => {
                let changed = !same_value(param.value, value);
                param.value = value;
                changed
            }
            None => false,
        };
        if changed {
            self.mark_dirty(id);
        }
    }

    pub(crate) fn mark_dirty(&mut self, id: ParamId) {
        if let Some(param) = self.table.get_mut(id) {
            param.state.insert(ParamState::DIRTY);
            self.notify.note_dirty(id);
        }
    }

    /// Raise Present; the transition also raises Dirty.
    pub(crate) fn set_present(&mut self, id: ParamId) {
        self.update_present(id, true);
    }

    /// Clear Present; the transition also raises Dirty.
    pub(crate) fn clear_present(&mut self, id: ParamId) {
        self.update_present(id, false);
    }

    fn update_present(&mut self, id: ParamId, present: bool) {
        let Some(param) = self.table.get_mut(id) else {
            return;
        };
        if param.state.contains(ParamState::PRESENT) != present {
            param.state.set(ParamState::PRESENT, present);
            self.mark_dirty(id);
        }
    }

    pub(crate) fn set_state_flag(&mut self, id: ParamId, flag: ParamState) {
        if let Some(param) = self.table.get_mut(id) {
            param.state.insert(flag);
        }
    }

    pub(crate) fn has_state(&self, id: ParamId, flag: ParamState) -> bool {
        self.table.get(id).is_some_and(|p| p.state.contains(flag))
    }
}
