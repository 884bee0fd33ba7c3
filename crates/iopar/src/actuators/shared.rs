//! `shared:SPEC`: several logical clients driving one backing parameter.
//!
//! The first client with a given `SPEC` creates the backing parameter from
//! it; later clients join the same master. A client writing a number becomes
//! a contributor. While others contribute, a write is refused unless it is
//! within the relative tolerance of the current backing value. Writing NaN
//! withdraws; when the last contributor withdraws the backing parameter goes
//! back to 0.

use ahash::AHashMap;
use tracing::debug;

use crate::backend::Backend;
use crate::error::{IoError, Result};
use crate::registry::Io;
use crate::state::ParamId;

struct Master {
    backing: ParamId,
    contributors: u32,
    clients: Vec<ParamId>,
}

#[derive(Default)]
pub(crate) struct SharedTable {
    masters: AHashMap<String, Master>,
}

struct SharedClient {
    master: String,
    contributes: bool,
}

pub(crate) fn create(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    if body.is_empty() {
        return Err(IoError::construction("shared:", "empty backing spec"));
    }
    let backing = match io.shared.masters.get(body) {
        Some(master) => master.backing,
        None => {
            let backing = io.create(body).map_err(|err| {
                IoError::construction(format!("shared:{body}"), format!("backing parameter: {err}"))
            })?;
            io.shared.masters.insert(
                body.to_owned(),
                Master {
                    backing,
                    contributors: 0,
                    clients: Vec::new(),
                },
            );
            backing
        }
    };
    if let Some(master) = io.shared.masters.get_mut(body) {
        master.clients.push(id);
    }

    let value = io.get_or(backing, f64::NAN);
    io.store_raw(id, value);
    if io.is_present(backing).unwrap_or(false) {
        io.set_present(id);
    }
    Ok(Box::new(SharedClient {
        master: body.to_owned(),
        contributes: false,
    }))
}

impl SharedClient {
    fn contributors(&self, io: &Io) -> u32 {
        io.shared.masters.get(&self.master).map_or(0, |m| m.contributors)
    }

    fn adjust_contributors(&self, io: &mut Io, delta: i32) {
        if let Some(master) = io.shared.masters.get_mut(&self.master) {
            master.contributors = master.contributors.saturating_add_signed(delta);
        }
    }
}

impl Backend for SharedClient {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, io: &mut Io, id: ParamId, value: f64) -> Result<()> {
        let Some(backing) = io.shared.masters.get(&self.master).map(|m| m.backing) else {
            return Err(IoError::NoDevice(id));
        };
        let contributing = !value.is_nan();
        let value = if contributing {
            let others = self.contributors(io) - u32::from(self.contributes);
            if others > 0 {
                let current = io.get_or(backing, 0.0);
                if (value - current).abs() > io.tuning.shared.tolerance * value.abs() {
                    debug!(target: "iopar.shared", param = %id, value, current, "refused, busy");
                    return Err(IoError::Busy(id));
                }
            }
            value
        } else {
            if !self.contributes {
                return Ok(());
            }
            self.contributes = false;
            self.adjust_contributors(io, -1);
            if self.contributors(io) > 0 {
                // Others still hold the current value.
                return Ok(());
            }
            0.0
        };

        io.set(backing, value)?;
        io.store_raw(id, value);
        if contributing && !self.contributes {
            self.contributes = true;
            self.adjust_contributors(io, 1);
        }

        let siblings: Vec<ParamId> = io
            .shared
            .masters
            .get(&self.master)
            .map(|m| m.clients.iter().copied().filter(|c| *c != id).collect())
            .unwrap_or_default();
        for sibling in siblings {
            io.store_raw(sibling, value);
            io.mark_dirty(sibling);
        }
        Ok(())
    }

    fn destroy(&mut self, io: &mut Io, id: ParamId) {
        // Withdraw; the last contributor reverts the backing parameter.
        if let Err(err) = self.write(io, id, f64::NAN) {
            debug!(target: "iopar.shared", param = %id, %err, "withdraw on destroy failed");
        }

        let Some(master) = io.shared.masters.get_mut(&self.master) else {
            return;
        };
        master.clients.retain(|c| *c != id);
        if master.clients.is_empty() {
            let backing = master.backing;
            io.shared.masters.remove(&self.master);
            io.destroy(backing);
        }
    }
}
