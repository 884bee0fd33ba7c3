//! Parameter identity and state bits.

use core::fmt;
use core::num::NonZeroU32;

use bitflags::bitflags;

/// Handle of a live parameter.
///
/// Ids start at 1; zero is never handed out. An id is stable while the
/// parameter lives and becomes eligible for reuse once it is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(NonZeroU32);

impl ParamId {
    /// Build an id from its numeric form. Returns `None` for 0.
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    pub(crate) const fn index(self) -> usize {
        self.0.get() as usize
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per-parameter state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamState: u8 {
        /// Changed since the last flush.
        const DIRTY       = 0b0001;
        /// The backing resource currently has real data.
        const PRESENT     = 0b0010;
        /// Remote peers may write it (netio `name>value`).
        const WRITABLE    = 0b0100;
        /// Input buttons only raise Dirty on the press edge.
        const PUSH_BUTTON = 0b1000;
    }
}

/// Bitwise value comparison: NaN equals NaN, `0.0` differs from `-0.0`.
#[must_use]
pub fn same_value(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

/// Boolean view of an analog value, `>= 0.5` is on.
#[must_use]
pub fn to_bool(value: f64) -> bool {
    value >= 0.5
}
