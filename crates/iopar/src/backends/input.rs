//! Linux input-event buttons: `in:DEV:TYPE:CODE[,debounce=S]` (also
//! `button:` and `kbd:`).
//!
//! `DEV` is a path, an event number (`3` for `event3` in the input
//! directory) or a name inside the input directory. One open file serves
//! every button on the same device. The value is the raw event value (1
//! pressed, 0 released, 2 autorepeat). When the device reports EOF or an
//! error its buttons drop to 0 and lose Present.

use core::time::Duration;
use std::ffi::c_long;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use iopar_reactor::{TimerHandle, secs};
use nix::fcntl::OFlag;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{IoError, Result};
use crate::event_loop::{FdTarget, TimerTarget};
use crate::registry::Io;
use crate::spec::leading_f64;
use crate::state::{ParamId, ParamState};

/// `struct input_event`: a timeval followed by type, code and value.
const EVENT_SIZE: usize = 2 * size_of::<c_long>() + 8;
const EV_KEY: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceKey(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputEvent {
    kind: u16,
    code: u16,
    value: i32,
}

impl InputEvent {
    fn decode(raw: &[u8]) -> Option<Self> {
        let at = 2 * size_of::<c_long>();
        let field = raw.get(at..at + 8)?;
        Some(Self {
            kind: u16::from_ne_bytes([field[0], field[1]]),
            code: u16::from_ne_bytes([field[2], field[3]]),
            value: i32::from_ne_bytes([field[4], field[5], field[6], field[7]]),
        })
    }
}

struct Button {
    id: ParamId,
    kind: u16,
    code: u16,
    debounce: Option<Duration>,
    pending: Option<i32>,
    timer: Option<TimerHandle>,
}

struct InputDevice {
    path: PathBuf,
    /// `None` once the device reported EOF or an error.
    file: Option<File>,
    buttons: Vec<Button>,
}

impl InputDevice {
    /// Read every complete event currently available. Returns the error
    /// that ended the device, if any.
    fn drain(&mut self, events: &mut Vec<InputEvent>) -> Option<std::io::Error> {
        let file = self.file.as_mut()?;
        let mut buf = [0u8; EVENT_SIZE * 16];
        loop {
            match file.read(&mut buf) {
                Ok(0) => return Some(std::io::Error::new(ErrorKind::UnexpectedEof, "EOF")),
                Ok(n) => events.extend(buf[..n].chunks_exact(EVENT_SIZE).filter_map(InputEvent::decode)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return None,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Some(err),
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct InputDevices {
    devices: Vec<Option<InputDevice>>,
}

impl InputDevices {
    pub(crate) fn device_fd(&self, key: DeviceKey) -> Option<BorrowedFd<'_>> {
        self.get(key)?.file.as_ref().map(AsFd::as_fd)
    }

    fn get(&self, key: DeviceKey) -> Option<&InputDevice> {
        self.devices.get(key.0)?.as_ref()
    }

    fn get_mut(&mut self, key: DeviceKey) -> Option<&mut InputDevice> {
        self.devices.get_mut(key.0)?.as_mut()
    }

    fn find_open(&self, path: &Path) -> Option<DeviceKey> {
        self.devices
            .iter()
            .position(|d| d.as_ref().is_some_and(|d| d.file.is_some() && d.path == path))
            .map(DeviceKey)
    }

    fn insert(&mut self, device: InputDevice) -> DeviceKey {
        match self.devices.iter().position(Option::is_none) {
            Some(idx) => {
                self.devices[idx] = Some(device);
                DeviceKey(idx)
            }
            None => {
                self.devices.push(Some(device));
                DeviceKey(self.devices.len() - 1)
            }
        }
    }

    fn button_mut(&mut self, key: DeviceKey, id: ParamId) -> Option<&mut Button> {
        self.get_mut(key)?.buttons.iter_mut().find(|b| b.id == id)
    }
}

fn parse_u16(text: &str) -> Option<u16> {
    let text = text.trim();
    match text.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn device_path(input_dir: &Path, dev: &str) -> PathBuf {
    if dev.contains('/') {
        return PathBuf::from(dev);
    }
    if dev.is_empty() || dev.bytes().all(|b| b.is_ascii_digit()) {
        let num: u32 = dev.parse().unwrap_or(0);
        return input_dir.join(format!("event{num}"));
    }
    input_dir.join(dev)
}

struct ButtonParam {
    device: DeviceKey,
}

pub(crate) fn create(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    let spec = format!("in:{body}");
    let mut positional = Vec::new();
    let mut debounce = None;
    for token in body.split([':', ';', ',']) {
        match token.split_once('=') {
            Some(("debounce", value)) => {
                let seconds = leading_f64(value)
                    .map(|(v, _)| v)
                    .ok_or_else(|| IoError::construction(&spec, "bad debounce"))?;
                debounce = Some(secs(seconds)).filter(|d| !d.is_zero());
            }
            Some((other, _)) => {
                return Err(IoError::construction(&spec, format!("unknown option `{other}`")));
            }
            None => positional.push(token),
        }
    }
    let dev = positional.first().copied().unwrap_or("");
    let kind = match positional.get(1) {
        Some(text) => parse_u16(text).ok_or_else(|| IoError::construction(&spec, "bad event type"))?,
        None => EV_KEY,
    };
    let code = match positional.get(2) {
        Some(text) => parse_u16(text).ok_or_else(|| IoError::construction(&spec, "bad event code"))?,
        None => 0,
    };
    if code == 0 {
        warn!(target: "iopar.input", spec, "no code or zero?");
    }

    let path = device_path(&io.tuning.paths.input_dir, dev);
    let key = match io.inputs.find_open(&path) {
        Some(key) => key,
        None => {
            let file = File::options()
                .read(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(&path)
                .map_err(|err| IoError::construction(&spec, format!("open {}: {err}", path.display())))?;
            debug!(target: "iopar.input", path = %path.display(), "device opened");
            let key = io.inputs.insert(InputDevice {
                path,
                file: Some(file),
                buttons: Vec::new(),
            });
            io.watch_fd(FdTarget::InputDevice(key));
            key
        }
    };
    if let Some(device) = io.inputs.get_mut(key) {
        device.buttons.push(Button {
            id,
            kind,
            code,
            debounce,
            pending: None,
            timer: None,
        });
    }

    io.store_raw(id, 0.0);
    io.set_present(id);
    if let Some(param) = io.table.get_mut(id) {
        param.state.remove(ParamState::DIRTY);
    }
    Ok(Box::new(ButtonParam { device: key }))
}

impl Backend for ButtonParam {
    fn destroy(&mut self, io: &mut Io, id: ParamId) {
        let key = self.device;
        let Some(device) = io.inputs.get_mut(key) else {
            return;
        };
        device.buttons.retain(|b| b.id != id);
        if device.buttons.is_empty() {
            debug!(target: "iopar.input", path = %device.path.display(), "device closed");
            io.inputs.devices[key.0] = None;
            io.unwatch_fd(FdTarget::InputDevice(key));
        }
    }
}

impl Io {
    pub(crate) fn input_readable(&mut self, key: DeviceKey) {
        let mut events = Vec::new();
        let failure = match self.inputs.get_mut(key) {
            Some(device) => device.drain(&mut events),
            None => return,
        };
        for event in events {
            self.input_event(key, event);
        }
        if let Some(err) = failure {
            self.input_device_lost(key, &err);
        }
    }

    fn input_event(&mut self, key: DeviceKey, event: InputEvent) {
        let Some(device) = self.inputs.get_mut(key) else {
            return;
        };
        let Some(button) = device
            .buttons
            .iter_mut()
            .find(|b| b.kind == event.kind && b.code == event.code)
        else {
            return;
        };
        let (id, debounce) = (button.id, button.debounce);
        match debounce {
            Some(delay) => {
                button.pending = Some(event.value);
                let mut slot = button.timer.take();
                // Restart the quiet period on every bounce.
                self.reschedule(&mut slot, delay, TimerTarget::Debounce { device: key, id });
                if let Some(button) = self.inputs.button_mut(key, id) {
                    button.timer = slot;
                }
            }
            None => self.apply_button(id, event.value),
        }
    }

    pub(crate) fn input_debounced(&mut self, key: DeviceKey, id: ParamId) {
        let pending = match self.inputs.button_mut(key, id) {
            Some(button) => {
                button.timer = None;
                button.pending.take()
            }
            None => None,
        };
        if let Some(value) = pending {
            self.apply_button(id, value);
        }
    }

    fn apply_button(&mut self, id: ParamId, value: i32) {
        let Some(param) = self.table.get(id) else {
            return;
        };
        let raise = if param.state.contains(ParamState::PUSH_BUTTON) {
            param.value as i64 == 0 && value != 0
        } else {
            true
        };
        self.store_raw(id, f64::from(value));
        if raise {
            self.mark_dirty(id);
        }
    }

    fn input_device_lost(&mut self, key: DeviceKey, err: &std::io::Error) {
        self.unwatch_fd(FdTarget::InputDevice(key));
        let Some(device) = self.inputs.get_mut(key) else {
            return;
        };
        warn!(target: "iopar.input", path = %device.path.display(), %err, "input device lost");
        device.file = None;
        let buttons: Vec<(ParamId, Option<TimerHandle>)> = device
            .buttons
            .iter_mut()
            .map(|b| {
                b.pending = None;
                (b.id, b.timer.take())
            })
            .collect();
        for (id, timer) in buttons {
            self.cancel_timer(timer);
            self.store_raw(id, 0.0);
            self.mark_dirty(id);
            self.clear_present(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn event(kind: u16, code: u16, value: i32) -> Vec<u8> {
        let mut raw = vec![0u8; 2 * size_of::<c_long>()];
        raw.extend_from_slice(&kind.to_ne_bytes());
        raw.extend_from_slice(&code.to_ne_bytes());
        raw.extend_from_slice(&value.to_ne_bytes());
        raw
    }

    fn fifo(dir: &Path) -> PathBuf {
        let path = dir.join("event7");
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::S_IRWXU).unwrap();
        path
    }

    #[test]
    fn decodes_event_layout() {
        let raw = event(EV_KEY, 30, 1);
        assert_eq!(raw.len(), EVENT_SIZE);
        assert_eq!(
            InputEvent::decode(&raw),
            Some(InputEvent { kind: 1, code: 30, value: 1 })
        );
    }

    #[test]
    fn device_names_resolve_in_input_dir() {
        let dir = Path::new("/dev/input");
        assert_eq!(device_path(dir, "3"), dir.join("event3"));
        assert_eq!(device_path(dir, ""), dir.join("event0"));
        assert_eq!(device_path(dir, "by-id/kbd"), PathBuf::from("by-id/kbd"));
        assert_eq!(device_path(dir, "mice"), dir.join("mice"));
    }

    #[test]
    fn events_drive_buttons_until_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo(dir.path());
        let mut tuning = crate::tuning::Tuning::default();
        tuning.paths.input_dir = dir.path().to_path_buf();
        let mut io = Io::builder().manual_clock().tuning(tuning).build();

        let a = io.create("in:7:1:30").unwrap();
        let b = io.create("button:7:1:48").unwrap();
        assert!(io.is_present(a).unwrap());
        assert!(!io.is_dirty(a).unwrap());

        let mut writer = File::options().write(true).open(&path).unwrap();
        writer.write_all(&event(EV_KEY, 48, 1)).unwrap();
        io.run_once(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(io.get(b).unwrap(), 1.0);
        assert!(io.is_dirty(b).unwrap());
        assert!(!io.is_dirty(a).unwrap());
        io.flush();

        drop(writer);
        io.run_once(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(io.get(b).unwrap(), 0.0);
        assert!(!io.is_present(b).unwrap());
        assert!(!io.is_present(a).unwrap());
    }

    #[test]
    fn push_button_only_signals_press() {
        let dir = tempfile::tempdir().unwrap();
        let path = fifo(dir.path());
        let mut io = Io::builder().manual_clock().build();
        let id = io.create(&format!("kbd:{}:1:28", path.display())).unwrap();
        io.set_push_button(id).unwrap();

        let mut writer = File::options().write(true).open(&path).unwrap();
        writer.write_all(&event(EV_KEY, 28, 1)).unwrap();
        io.run_once(Some(Duration::from_millis(200))).unwrap();
        assert!(io.is_dirty(id).unwrap());
        io.flush();

        writer.write_all(&event(EV_KEY, 28, 0)).unwrap();
        io.run_once(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(io.get(id).unwrap(), 0.0);
        assert!(!io.is_dirty(id).unwrap(), "release is silent");
    }

    #[test]
    fn missing_device_fails_construction() {
        let mut io = Io::builder().manual_clock().build();
        assert!(io.create("in:/nonexistent/event9:1:2").is_err());
        assert!(io.is_empty());
    }
}
