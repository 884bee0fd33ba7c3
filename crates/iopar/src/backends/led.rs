//! LED and backlight brightness: `led:NAME[,bool]`, `bled:NAME`,
//! `backlight:NAME`.
//!
//! The value is brightness scaled to 0..1 by `max_brightness`.

use std::path::PathBuf;

use tracing::warn;

use crate::backend::Backend;
use crate::backends::read_int_or;
use crate::error::{IoError, Result};
use crate::registry::Io;
use crate::state::{ParamId, ParamState, to_bool};

struct Led {
    brightness: PathBuf,
    max: i64,
    boolean: bool,
}

fn check_name(spec: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(IoError::construction(spec, "bad device name"));
    }
    Ok(())
}

fn open_led(io: &mut Io, id: ParamId, name: &str, boolean: bool) -> Result<Box<dyn Backend>> {
    check_name(&format!("led:{name}"), name)?;
    let dir = io.tuning.paths.sysfs_root.join("class/leds").join(name);
    let max = read_int_or(&dir.join("max_brightness"), 255).max(1);
    let brightness = dir.join("brightness");
    let mut value = read_int_or(&brightness, 0) as f64 / max as f64;
    if boolean {
        value = if to_bool(value) { 1.0 } else { 0.0 };
    }
    io.store_raw(id, value);
    io.set_present(id);
    Ok(Box::new(Led {
        brightness,
        max,
        boolean,
    }))
}

pub(crate) fn create_led(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    match body.split_once(',') {
        Some((name, "bool")) => open_led(io, id, name, true),
        Some((_, flag)) => Err(IoError::construction(
            format!("led:{body}"),
            format!("unknown flag `{flag}`"),
        )),
        None => open_led(io, id, body, false),
    }
}

pub(crate) fn create_bool_led(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    open_led(io, id, body, true)
}

pub(crate) fn create_backlight(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    check_name(&format!("backlight:{body}"), body)?;
    let dir = io.tuning.paths.sysfs_root.join("class/backlight").join(body);
    let max = read_int_or(&dir.join("max_brightness"), 255).max(1);
    // Backlights report their level through a separate attribute.
    let actual = read_int_or(&dir.join("actual_brightness"), max / 2);
    io.store_raw(id, actual as f64 / max as f64);
    io.set_present(id);
    Ok(Box::new(Led {
        brightness: dir.join("brightness"),
        max,
        boolean: false,
    }))
}

impl Backend for Led {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, io: &mut Io, id: ParamId, value: f64) -> Result<()> {
        let value = match (self.boolean, to_bool(value)) {
            (false, _) => value,
            (true, true) => 1.0,
            (true, false) => 0.0,
        };
        let raw = if value.is_nan() {
            0
        } else {
            ((value * self.max as f64) as i64).clamp(0, self.max)
        };
        match std::fs::write(&self.brightness, raw.to_string()) {
            Ok(()) => {
                io.store_raw(id, value);
                io.set_present(id);
                Ok(())
            }
            Err(err) => {
                if io.has_state(id, ParamState::PRESENT) {
                    warn!(target: "iopar.sysfs", path = %self.brightness.display(), %err, "write failed");
                }
                io.clear_present(id);
                Err(err.into())
            }
        }
    }
}
