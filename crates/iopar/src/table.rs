//! Slot table holding every live parameter.
//!
//! Slot 0 is permanently empty so that ids start at 1. New parameters take the
//! lowest free slot: a cursor remembers where the scan resumes, and freeing a
//! slot below the cursor rewinds it. The table grows in chunks and never
//! shrinks.

use crate::backend::Backend;
use crate::notify::Notifier;
use crate::state::{ParamId, ParamState};

const GROW_BY: usize = 16;

pub(crate) struct Param {
    pub(crate) value: f64,
    pub(crate) state: ParamState,
    pub(crate) name: Option<String>,
    pub(crate) kind: &'static str,
    pub(crate) notifiers: Vec<Notifier>,
    /// Taken out while one of its hooks runs.
    pub(crate) backend: Option<Box<dyn Backend>>,
    /// Distinguishes successive occupants of the same slot.
    pub(crate) serial: u64,
    pub(crate) dying: bool,
}

impl Param {
    pub(crate) fn new(kind: &'static str, serial: u64) -> Self {
        Self {
            value: f64::NAN,
            state: ParamState::empty(),
            name: None,
            kind,
            notifiers: Vec::new(),
            backend: None,
            serial,
            dying: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct ParamTable {
    slots: Vec<Option<Param>>,
    cursor: usize,
}

impl ParamTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            cursor: 1,
        }
    }

    /// Store `param` in the lowest free slot.
    pub(crate) fn insert(&mut self, param: Param) -> ParamId {
        let mut idx = self.cursor.max(1);
        while idx < self.slots.len() && self.slots[idx].is_some() {
            idx += 1;
        }
        if idx >= self.slots.len() {
            let len = (idx + 1).next_multiple_of(GROW_BY);
            self.slots.resize_with(len, || None);
        }
        self.slots[idx] = Some(param);
        self.cursor = idx + 1;
        // idx >= 1 and bounded by the table length.
        ParamId::new(idx as u32).unwrap_or_else(|| unreachable!("slot 0 is reserved"))
    }

    pub(crate) fn remove(&mut self, id: ParamId) -> Option<Param> {
        let param = self.slots.get_mut(id.index())?.take()?;
        if id.index() < self.cursor {
            self.cursor = id.index();
        }
        Some(param)
    }

    pub(crate) fn get(&self, id: ParamId) -> Option<&Param> {
        self.slots.get(id.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ParamId) -> Option<&mut Param> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub(crate) fn contains(&self, id: ParamId) -> bool {
        self.get(id).is_some()
    }

    /// Live ids in ascending order.
    pub(crate) fn ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(idx, _)| ParamId::new(idx as u32))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.slots.iter_mut().flatten()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}
