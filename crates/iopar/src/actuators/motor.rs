//! Motors: `dmotor:TYPE+OUT1+OUT2+MAXVAL`, paired with the `pmotor:` created
//! right after it.
//!
//! One motor publishes two parameters. The direction parameter holds the
//! current speed in `-1..=1` and accepts speed requests. The position
//! parameter holds the tracked position in `0..=1`, integrated from speed
//! over the calibrated travel time `MAXVAL` (seconds), and accepts position
//! setpoints.
//!
//! Output topologies:
//!
//! - `updown`: `OUT1` drives up, `OUT2` drives down
//! - `godir`: `OUT1` carries the magnitude, `OUT2` the direction (1 = down)
//!
//! Stopping enters a cooldown before the motor may start again, so relays
//! never see an instant reversal.

use iopar_reactor::{TimerHandle, secs};
use tracing::{debug, trace, warn};

use crate::backend::Backend;
use crate::error::{IoError, Result};
use crate::event_loop::TimerTarget;
use crate::registry::Io;
use crate::spec::leading_f64;
use crate::state::ParamId;

/// Arena index of a motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MotorId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topology {
    UpDown,
    GoDir,
}

const TOPOLOGIES: &[(&str, Topology)] = &[("updown", Topology::UpDown), ("godir", Topology::GoDir)];

fn lookup_topology(name: &str) -> Option<Topology> {
    if name.is_empty() {
        return Some(Topology::UpDown);
    }
    TOPOLOGIES
        .iter()
        .find(|(full, _)| full.starts_with(name))
        .map(|(_, topology)| *topology)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Busy,
    /// Cooldown after a stop.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Direction,
    Position,
}

struct Motor {
    topology: Topology,
    out1: ParamId,
    out2: ParamId,
    /// Seconds for a full course at speed 1.
    travel: f64,
    dir: Option<ParamId>,
    pos: Option<ParamId>,
    refs: u32,
    phase: Phase,
    mode: Mode,
    /// Requested speed in direction mode.
    request: f64,
    /// Requested position in position mode, NaN holds.
    setpoint: f64,
    speed: f64,
    /// Tracked position, may overshoot the course by the hysteresis.
    position: f64,
    last: f64,
    timer: Option<TimerHandle>,
    failures: u32,
}

#[derive(Default)]
pub(crate) struct Motors {
    slots: Vec<Option<Motor>>,
}

impl Motors {
    fn insert(&mut self, motor: Motor) -> MotorId {
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(motor);
            return MotorId(idx);
        }
        self.slots.push(Some(motor));
        MotorId(self.slots.len() - 1)
    }

    fn take(&mut self, id: MotorId) -> Option<Motor> {
        self.slots.get_mut(id.0)?.take()
    }

    fn put(&mut self, id: MotorId, motor: Motor) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = Some(motor);
        }
    }
}

/// Backend of both motor parameters.
struct MotorParam {
    motor: MotorId,
    role: Mode,
}

pub(crate) fn create_dir(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    let spec = format!("dmotor:{body}");
    let parts: Vec<&str> = body.split('+').collect();
    let &[kind, out1, out2, maxval, ..] = parts.as_slice() else {
        return Err(IoError::construction(
            &spec,
            "need [updown|godir]+OUT1+OUT2+MAXVAL",
        ));
    };
    let topology = lookup_topology(kind)
        .ok_or_else(|| IoError::construction(&spec, format!("bad motor type `{kind}`")))?;
    let travel = leading_f64(maxval).map_or(f64::NAN, |(n, _)| n);
    if !(travel > 0.0) {
        return Err(IoError::construction(&spec, format!("bad travel time `{maxval}`")));
    }

    let out1 = io
        .create(out1)
        .map_err(|err| IoError::construction(&spec, format!("bad output: {err}")))?;
    let out2 = match io.create(out2) {
        Ok(out2) => out2,
        Err(err) => {
            io.destroy(out1);
            return Err(IoError::construction(&spec, format!("bad output: {err}")));
        }
    };

    let motor = io.motors.insert(Motor {
        topology,
        out1,
        out2,
        travel,
        dir: Some(id),
        pos: None,
        refs: 1,
        phase: Phase::Idle,
        mode: Mode::Direction,
        request: 0.0,
        setpoint: f64::NAN,
        speed: 0.0,
        position: 0.0,
        last: io.now_secs(),
        timer: None,
        failures: 0,
    });
    io.pending_pos = Some(motor);
    io.store_raw(id, 0.0);
    io.set_present(id);
    Ok(Box::new(MotorParam {
        motor,
        role: Mode::Direction,
    }))
}

pub(crate) fn create_pos(io: &mut Io, id: ParamId, _body: &str) -> Result<Box<dyn Backend>> {
    let Some(motor) = io.pending_pos.take() else {
        return Err(IoError::construction("pmotor:", "must directly follow a dmotor"));
    };
    let Some(mut state) = io.motors.take(motor) else {
        return Err(IoError::construction("pmotor:", "motor is gone"));
    };
    state.pos = Some(id);
    state.refs += 1;
    io.store_raw(id, state.position.clamp(0.0, 1.0));
    io.motors.put(motor, state);
    io.set_present(id);
    Ok(Box::new(MotorParam {
        motor,
        role: Mode::Position,
    }))
}

impl Motor {
    fn hysteresis(io: &Io) -> f64 {
        io.tuning.motor.hysteresis
    }

    fn update_position(&mut self, io: &mut Io) {
        let now = io.now_secs();
        self.position += self.speed * (now - self.last) / self.travel;
        self.last = now;
        if let Some(pos) = self.pos {
            io.store(pos, self.position.clamp(0.0, 1.0));
        }
    }

    /// Speed the motor should run at now.
    fn wanted_speed(&self, io: &Io) -> f64 {
        let hyst = Self::hysteresis(io);
        let want = match self.mode {
            Mode::Direction => self.request,
            Mode::Position => {
                let setpoint = self.setpoint;
                let deadband = io.tuning.motor.deadband;
                if setpoint.is_nan() {
                    0.0
                } else if setpoint <= 0.0 && self.position > -hyst {
                    -1.0
                } else if setpoint >= 1.0 && self.position < 1.0 + hyst {
                    1.0
                } else if setpoint - self.position > deadband {
                    1.0
                } else if self.position - setpoint > deadband {
                    -1.0
                } else {
                    0.0
                }
            }
        };
        if (want < 0.0 && self.position <= -hyst) || (want > 0.0 && self.position >= 1.0 + hyst) {
            return 0.0;
        }
        want
    }

    /// Position at which the current run ends.
    fn endpoint(&self, io: &Io) -> f64 {
        let hyst = Self::hysteresis(io);
        match self.mode {
            Mode::Position if self.setpoint > 0.0 && self.setpoint < 1.0 => self.setpoint,
            _ if self.speed < 0.0 => -hyst,
            _ => 1.0 + hyst,
        }
    }

    fn next_wakeup(&self, io: &Io) -> f64 {
        let poll = io.tuning.motor.poll_secs;
        let distance = (self.endpoint(io) - self.position).abs();
        let remaining = distance * self.travel / self.speed.abs();
        let delay = if remaining <= poll {
            remaining
        } else if remaining < 2.0 * poll {
            remaining / 2.0
        } else {
            poll
        };
        delay.max(1e-3)
    }

    fn drive(&self, io: &mut Io, speed: f64) -> Result<()> {
        let magnitude = speed.abs();
        if speed == 0.0 {
            io.set(self.out1, 0.0)?;
            io.set(self.out2, 0.0)?;
            return Ok(());
        }
        match (self.topology, speed > 0.0) {
            (Topology::UpDown, true) => {
                io.set(self.out2, 0.0)?;
                io.set(self.out1, magnitude)?;
            }
            (Topology::UpDown, false) => {
                io.set(self.out1, 0.0)?;
                io.set(self.out2, magnitude)?;
            }
            (Topology::GoDir, up) => {
                io.set(self.out2, if up { 0.0 } else { 1.0 })?;
                io.set(self.out1, magnitude)?;
            }
        }
        Ok(())
    }

    fn set_speed(&mut self, io: &mut Io, speed: f64) {
        self.speed = speed;
        if let Some(dir) = self.dir {
            io.store(dir, speed);
        }
    }

    /// Park idle after repeated output failures.
    fn park(&mut self, io: &mut Io) {
        if let Err(err) = self.drive(io, 0.0) {
            warn!(target: "iopar.motor", %err, "cannot stop outputs while parking");
        }
        self.set_speed(io, 0.0);
        self.request = 0.0;
        self.setpoint = f64::NAN;
        self.phase = Phase::Idle;
        self.failures = 0;
    }

    fn run(&mut self, io: &mut Io, id: MotorId) {
        io.cancel_timer(self.timer.take());
        self.update_position(io);

        let mut want = self.wanted_speed(io);
        if want == 0.0 && self.mode == Mode::Direction {
            self.request = 0.0;
        }
        // Reversals pass through a stop and the cooldown.
        if self.speed != 0.0 && want != 0.0 && self.speed.signum() != want.signum() {
            want = 0.0;
        }

        let previous = self.speed;
        if want != previous {
            if let Err(err) = self.drive(io, want) {
                self.failures += 1;
                if self.failures > io.tuning.motor.max_retries {
                    warn!(target: "iopar.motor", %err, failures = self.failures, "outputs keep failing, parking");
                    self.park(io);
                    return;
                }
                debug!(target: "iopar.motor", %err, failures = self.failures, "output failed, retrying");
                let delay = secs(io.tuning.motor.cooldown_secs);
                io.reschedule(&mut self.timer, delay, TimerTarget::Motor(id));
                return;
            }
            self.failures = 0;
            self.set_speed(io, want);
        }

        if self.speed != 0.0 {
            self.phase = Phase::Busy;
            let delay = secs(self.next_wakeup(io));
            io.reschedule(&mut self.timer, delay, TimerTarget::Motor(id));
        } else if previous != 0.0 {
            self.phase = Phase::Wait;
            let delay = secs(io.tuning.motor.cooldown_secs);
            io.reschedule(&mut self.timer, delay, TimerTarget::Motor(id));
        } else {
            self.phase = Phase::Idle;
        }
        trace!(
            target: "iopar.motor",
            speed = self.speed,
            position = self.position,
            phase = ?self.phase,
            "step"
        );
    }
}

impl Io {
    /// Create a `dmotor:` direction parameter and its `pmotor:` position
    /// parameter. `body` is `TYPE+OUT1+OUT2+MAXVAL`.
    pub fn create_motor(&mut self, body: &str) -> Result<(ParamId, ParamId)> {
        let dir = self.create_typed("dmotor", body)?;
        match self.create_typed("pmotor", "") {
            Ok(pos) => Ok((dir, pos)),
            Err(err) => {
                self.destroy(dir);
                Err(err)
            }
        }
    }

    pub(crate) fn motor_step(&mut self, id: MotorId) {
        let Some(mut motor) = self.motors.take(id) else {
            return;
        };
        // The timer that brought us here already fired.
        motor.timer = None;
        motor.run(self, id);
        self.motors.put(id, motor);
    }

    fn with_motor<R>(&mut self, id: MotorId, f: impl FnOnce(&mut Motor, &mut Io) -> R) -> Option<R> {
        let mut motor = self.motors.take(id)?;
        let out = f(&mut motor, self);
        self.motors.put(id, motor);
        Some(out)
    }
}

impl Backend for MotorParam {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, io: &mut Io, id: ParamId, value: f64) -> Result<()> {
        let motor = self.motor;
        let role = self.role;
        io.with_motor(motor, |m, io| {
            match role {
                Mode::Direction if value.is_nan() => {
                    m.mode = Mode::Position;
                }
                Mode::Direction => {
                    m.update_position(io);
                    let value = value.clamp(-1.0, 1.0);
                    if (value > 0.0 && m.position >= 1.0) || (value < 0.0 && m.position <= 0.0) {
                        // Already at the end of course.
                        debug!(target: "iopar.motor", param = %id, value, "end of course");
                        m.mode = Mode::Direction;
                        m.request = 0.0;
                        io.mark_dirty(id);
                    } else {
                        m.mode = Mode::Direction;
                        m.request = value;
                    }
                }
                Mode::Position => {
                    m.mode = Mode::Position;
                    m.setpoint = value;
                }
            }
            if m.phase != Phase::Wait {
                m.run(io, motor);
            }
        })
        .ok_or(IoError::NoDevice(id))
    }

    fn refresh(&mut self, io: &mut Io, _id: ParamId) {
        if self.role == Mode::Position {
            io.with_motor(self.motor, |m, io| m.update_position(io));
        }
    }

    fn destroy(&mut self, io: &mut Io, id: ParamId) {
        let motor = self.motor;
        let Some(mut m) = io.motors.take(motor) else {
            return;
        };
        match self.role {
            Mode::Direction => m.dir = None,
            Mode::Position => m.pos = None,
        }
        m.refs -= 1;
        if m.refs > 0 {
            io.motors.put(motor, m);
            return;
        }
        io.cancel_timer(m.timer.take());
        if let Err(err) = m.drive(io, 0.0) {
            debug!(target: "iopar.motor", param = %id, %err, "cannot stop outputs");
        }
        io.destroy(m.out1);
        io.destroy(m.out2);
        if io.pending_pos == Some(motor) {
            io.pending_pos = None;
        }
    }
}
