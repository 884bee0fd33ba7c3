//! `teleruptor:OUT+FEEDBACK`: a bistable relay toggled by pulses on `OUT`
//! and read back through `FEEDBACK`.
//!
//! A setpoint change pulses the output (high, settle, low, settle) and then
//! compares the feedback. A mismatch pulses again, at most
//! `max_pulses` times per setpoint change. The value always mirrors the
//! feedback, never the setpoint.

use iopar_reactor::secs;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{IoError, Result};
use crate::registry::Io;
use crate::state::{ParamId, to_bool};

const STEP: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Output is high.
    Set,
    /// Output released, waiting for the feedback to settle.
    Wait,
}

struct Teleruptor {
    out: ParamId,
    feedback: ParamId,
    phase: Phase,
    target: bool,
    pulses: u32,
}

pub(crate) fn create(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    let spec = format!("teleruptor:{body}");
    let mut parts = body.split('+');
    let (Some(out), Some(feedback)) = (parts.next(), parts.next()) else {
        return Err(IoError::construction(&spec, "need OUT+FEEDBACK"));
    };
    if out.is_empty() || feedback.is_empty() {
        return Err(IoError::construction(&spec, "need OUT+FEEDBACK"));
    }

    let out = io
        .create(out)
        .map_err(|err| IoError::construction(&spec, format!("output: {err}")))?;
    let feedback = match io.create(feedback) {
        Ok(feedback) => feedback,
        Err(err) => {
            io.destroy(out);
            return Err(IoError::construction(&spec, format!("feedback: {err}")));
        }
    };
    if let Err(err) = io.link_notifier(feedback, id) {
        io.destroy(feedback);
        io.destroy(out);
        return Err(err);
    }

    let mut relay = Teleruptor {
        out,
        feedback,
        phase: Phase::Idle,
        target: false,
        pulses: 0,
    };
    relay.update(io, id);
    Ok(Box::new(relay))
}

impl Teleruptor {
    /// Mirror the feedback. Dirty is raised only when its boolean view
    /// changed.
    fn update(&self, io: &mut Io, id: ParamId) {
        if !io.is_present(self.feedback).unwrap_or(false) {
            return;
        }
        let value = io.get_or(self.feedback, f64::NAN);
        let changed = to_bool(value) != to_bool(io.value(id));
        io.store_raw(id, value);
        if changed {
            io.mark_dirty(id);
        }
        io.set_present(id);
    }

    fn drive(&self, io: &mut Io, level: f64) {
        if let Err(err) = io.set(self.out, level) {
            debug!(target: "iopar.teleruptor", out = %self.out, level, %err, "output write failed");
        }
    }

    fn step(&mut self, io: &mut Io, id: ParamId) {
        let settle = secs(io.tuning.teleruptor.settle_secs);
        if self.phase == Phase::Wait {
            self.update(io, id);
            if to_bool(io.value(id)) == self.target {
                self.phase = Phase::Idle;
                return;
            }
            if self.pulses >= io.tuning.teleruptor.max_pulses {
                warn!(
                    target: "iopar.teleruptor",
                    param = %id,
                    pulses = self.pulses,
                    "feedback never followed, giving up"
                );
                self.phase = Phase::Idle;
                return;
            }
            self.phase = Phase::Idle;
        }
        match self.phase {
            Phase::Idle => {
                self.drive(io, 1.0);
                io.schedule_param(id, settle, STEP);
                self.phase = Phase::Set;
                self.pulses += 1;
            }
            Phase::Set => {
                self.drive(io, 0.0);
                io.schedule_param(id, settle, STEP);
                self.update(io, id);
                self.phase = Phase::Wait;
            }
            Phase::Wait => {}
        }
    }
}

impl Backend for Teleruptor {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, io: &mut Io, id: ParamId, value: f64) -> Result<()> {
        self.target = to_bool(value);
        self.pulses = 0;
        if self.phase == Phase::Idle {
            self.update(io, id);
            if to_bool(io.value(id)) != self.target {
                self.step(io, id);
            }
        }
        Ok(())
    }

    fn timer(&mut self, io: &mut Io, id: ParamId, _tag: u32) {
        self.step(io, id);
    }

    fn notified(&mut self, io: &mut Io, id: ParamId, _source: ParamId) {
        // A wall switch toggled the relay.
        if self.phase == Phase::Idle {
            self.update(io, id);
        }
    }

    fn destroy(&mut self, io: &mut Io, _id: ParamId) {
        io.destroy(self.feedback);
        io.destroy(self.out);
    }
}
