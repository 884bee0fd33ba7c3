//! `sysfs:PATH[,delay=S][,invert][,edge=V][,hysteresis=V][,mul=V][,max=V]`
//!
//! A polled attribute. The raw integer is scaled by `mul` (or `1/max`). With
//! `edge` the value becomes boolean, optionally through a Schmitt trigger of
//! width `hysteresis`, and `invert` flips it. Writes store `value * 1000` as
//! an integer.

use std::path::PathBuf;

use iopar_reactor::secs;
use tracing::warn;

use crate::backend::Backend;
use crate::backends::read_int;
use crate::error::{IoError, Result};
use crate::registry::Io;
use crate::spec::{leading_f64, subopts};
use crate::state::{ParamId, ParamState};

const POLL: u32 = 0;

struct SysfsAttr {
    path: PathBuf,
    delay: f64,
    invert: bool,
    edge: Option<f64>,
    hysteresis: Option<f64>,
    mul: f64,
}

impl SysfsAttr {
    fn parse(io: &Io, body: &str) -> Result<Self> {
        let spec = format!("sysfs:{body}");
        let (path, options) = body.split_once(',').unwrap_or((body, ""));
        if path.is_empty() {
            return Err(IoError::construction(&spec, "missing path"));
        }
        let mut attr = Self {
            path: PathBuf::from(path),
            delay: io.tuning.sysfs.poll_secs,
            invert: false,
            edge: None,
            hysteresis: None,
            mul: 1.0,
        };
        let number = |value: Option<&str>, default: f64| -> f64 {
            value
                .and_then(|v| leading_f64(v).map(|(n, _)| n))
                .unwrap_or(default)
        };
        for opt in subopts(options) {
            match opt.key {
                "delay" => attr.delay = number(opt.value, 1.0),
                "invert" => attr.invert = true,
                "edge" => attr.edge = Some(number(opt.value, 0.0)),
                "hysteresis" => attr.hysteresis = Some(number(opt.value, 0.0)),
                "mul" => attr.mul = number(opt.value, 1.0),
                "max" => attr.mul = 1.0 / number(opt.value, 1.0),
                other => {
                    return Err(IoError::construction(&spec, format!("unknown flag `{other}`")));
                }
            }
        }
        if !(attr.delay > 0.0) {
            return Err(IoError::construction(&spec, "delay must be positive"));
        }
        Ok(attr)
    }

    /// Map a raw reading to the parameter value. `None` keeps the previous
    /// value (inside the hysteresis band).
    fn convert(&self, raw: i64, previous: f64) -> Option<f64> {
        let scaled = raw as f64 * self.mul;
        let Some(edge) = self.edge else {
            return Some(scaled);
        };
        let mut on = match self.hysteresis {
            Some(hyst) if scaled > edge + hyst => true,
            Some(hyst) if scaled < edge - hyst => false,
            Some(_) => return if previous.is_nan() { None } else { Some(previous) },
            None => scaled >= edge,
        };
        if self.invert {
            on = !on;
        }
        Some(if on { 1.0 } else { 0.0 })
    }

    fn poll(&self, io: &mut Io, id: ParamId, warn_always: bool) {
        let loud = warn_always || io.has_state(id, ParamState::PRESENT);
        match read_int(&self.path) {
            Ok(raw) => {
                if let Some(value) = self.convert(raw, io.value(id)) {
                    io.store(id, value);
                    io.set_present(id);
                }
            }
            Err(err) => {
                if loud {
                    warn!(target: "iopar.sysfs", path = %self.path.display(), %err, "read failed");
                }
                io.clear_present(id);
            }
        }
    }
}

pub(crate) fn create(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    let attr = SysfsAttr::parse(io, body)?;
    // Only readable attributes are polled.
    if std::fs::File::open(&attr.path).is_ok() {
        attr.poll(io, id, true);
        io.schedule_param(id, secs(attr.delay), POLL);
    }
    Ok(Box::new(attr))
}

impl Backend for SysfsAttr {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, io: &mut Io, id: ParamId, value: f64) -> Result<()> {
        // NaN releases control.
        let value = if value.is_nan() { 0.0 } else { value };
        let raw = (value * 1e3) as i64;
        match std::fs::write(&self.path, raw.to_string()) {
            Ok(()) => {
                io.store_raw(id, value);
                io.set_present(id);
                Ok(())
            }
            Err(err) => {
                if io.has_state(id, ParamState::PRESENT) {
                    warn!(target: "iopar.sysfs", path = %self.path.display(), %err, "write failed");
                }
                io.clear_present(id);
                Err(err.into())
            }
        }
    }

    fn timer(&mut self, io: &mut Io, id: ParamId, _tag: u32) {
        self.poll(io, id, false);
        io.repeat_param(id, secs(self.delay), POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use iopar_reactor::ManualClock;

    fn setup(contents: &str) -> (tempfile::TempDir, PathBuf, ManualClock, Io) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        std::fs::write(&path, contents).unwrap();
        let clock = ManualClock::new();
        let io = Io::builder().clock(clock.clone()).build();
        (dir, path, clock, io)
    }

    #[test]
    fn scaled_reading_and_polling() {
        let (_dir, path, clock, mut io) = setup("1500\n");
        let id = io.create(&format!("sysfs:{},max=1000", path.display())).unwrap();
        assert_eq!(io.get(id).unwrap(), 1.5);
        assert!(io.is_present(id).unwrap());
        io.flush();

        std::fs::write(&path, "500\n").unwrap();
        clock.advance(Duration::from_millis(999));
        io.fire_timers();
        assert_eq!(io.get(id).unwrap(), 1.5);
        clock.advance(Duration::from_millis(1));
        io.fire_timers();
        assert_eq!(io.get(id).unwrap(), 0.5);
        assert!(io.is_dirty(id).unwrap());
    }

    #[test]
    fn schmitt_trigger_holds_inside_band() {
        let (_dir, path, clock, mut io) = setup("10\n");
        let spec = format!("sysfs:{},edge=20,hysteresis=5,delay=0.1", path.display());
        let id = io.create(&spec).unwrap();
        assert_eq!(io.get(id).unwrap(), 0.0);

        for (raw, expect) in [("22", 0.0), ("26", 1.0), ("18", 1.0), ("14", 0.0)] {
            std::fs::write(&path, raw).unwrap();
            clock.advance(Duration::from_millis(100));
            io.fire_timers();
            assert_eq!(io.get(id).unwrap(), expect, "raw {raw}");
        }
    }

    #[test]
    fn invert_flips_edge() {
        let (_dir, path, _clock, mut io) = setup("30\n");
        let id = io.create(&format!("sysfs:{},edge=20,invert", path.display())).unwrap();
        assert_eq!(io.get(id).unwrap(), 0.0);
    }

    #[test]
    fn vanished_file_clears_present() {
        let (_dir, path, clock, mut io) = setup("1\n");
        let id = io.create(&format!("sysfs:{}", path.display())).unwrap();
        assert!(io.is_present(id).unwrap());
        io.flush();
        std::fs::remove_file(&path).unwrap();
        clock.advance(Duration::from_secs(1));
        io.fire_timers();
        assert!(!io.is_present(id).unwrap());
        assert!(io.is_dirty(id).unwrap(), "present transition raises dirty");
    }

    #[test]
    fn write_stores_millis() {
        let (_dir, path, _clock, mut io) = setup("0\n");
        let id = io.create(&format!("sysfs:{}", path.display())).unwrap();
        io.set(id, 1.25).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1250");
        io.set(id, f64::NAN).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let (_dir, path, _clock, mut io) = setup("0\n");
        assert!(io.create(&format!("sysfs:{},bogus", path.display())).is_err());
    }

    #[test]
    fn destroy_cancels_polling() {
        let (_dir, path, _clock, mut io) = setup("0\n");
        let id = io.create(&format!("sysfs:{}", path.display())).unwrap();
        assert!(io.next_deadline().is_some());
        io.destroy(id);
        assert!(io.next_deadline().is_none());
    }
}
