//! `virtual:BIT[,BIT2]`: one bit of a per-registry 32-bit state word.
//!
//! Several parameters may name the same bit; reads recompute the value from
//! the word so they always agree.

use tracing::debug;

use crate::backend::Backend;
use crate::error::{IoError, Result};
use crate::registry::Io;
use crate::state::ParamId;

struct VirtualBit {
    mask: u32,
    /// Related bit, only shown in the state dump.
    related: u32,
}

fn parse_bit(spec: &str, text: &str) -> Result<u32> {
    let text = text.trim();
    let bit = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    }
    .map_err(|_| IoError::construction(spec, format!("bad bit index `{text}`")))?;
    if bit >= u32::BITS {
        return Err(IoError::construction(spec, format!("bit {bit} out of range")));
    }
    Ok(1 << bit)
}

pub(crate) fn create(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    let spec = format!("virtual:{body}");
    let (first, second) = match body.split_once(',') {
        Some((a, b)) => (a, Some(b)),
        None => (body, None),
    };
    let mask = parse_bit(&spec, first)?;
    let related = second.map(|b| parse_bit(&spec, b)).transpose()?.unwrap_or(0);

    io.store_raw(id, if io.virtual_bits & mask != 0 { 1.0 } else { 0.0 });
    io.set_present(id);
    Ok(Box::new(VirtualBit { mask, related }))
}

/// Render the state word, bit 0 first, in groups of four. Bits of
/// `active` are upper case.
pub(crate) fn render_bits(state: u32, active: u32) -> String {
    let mut out = String::with_capacity(40);
    for bit in 0..u32::BITS {
        let mask = 1u32 << bit;
        if bit > 0 && bit % 4 == 0 {
            out.push(' ');
        }
        out.push(match (active & mask != 0, state & mask != 0) {
            (true, true) => 'X',
            (true, false) => '_',
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    out
}

impl Backend for VirtualBit {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, io: &mut Io, id: ParamId, value: f64) -> Result<()> {
        // NaN compares false and clears the bit.
        if value > 0.5 {
            io.virtual_bits |= self.mask;
        } else {
            io.virtual_bits &= !self.mask;
        }
        io.store_raw(id, value);
        debug!(
            target: "iopar.virtual",
            now = io.now_secs(),
            bits = %render_bits(io.virtual_bits, self.mask | self.related),
            "virtual state"
        );
        Ok(())
    }

    fn refresh(&mut self, io: &mut Io, id: ParamId) {
        let value = if io.virtual_bits & self.mask != 0 { 1.0 } else { 0.0 };
        io.store_raw(id, value);
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::Io;

    #[test]
    fn shared_bit_is_seen_by_both_parameters() {
        let mut io = Io::builder().manual_clock().build();
        let a = io.create("virtual:5").unwrap();
        let b = io.create("virtual:5").unwrap();
        io.set(a, 1.0).unwrap();
        assert_eq!(io.get(b).unwrap(), 1.0);
        io.set(b, f64::NAN).unwrap();
        assert_eq!(io.get(a).unwrap(), 0.0);
    }

    #[test]
    fn virtual_is_always_present() {
        let mut io = Io::builder().manual_clock().build();
        let id = io.create("virtual:0,1").unwrap();
        assert!(io.is_present(id).unwrap());
    }

    #[test]
    fn bad_bits_are_rejected() {
        let mut io = Io::builder().manual_clock().build();
        assert!(io.create("virtual:32").is_err());
        assert!(io.create("virtual:x").is_err());
        assert!(io.create("virtual:0x1f").is_ok());
    }

    #[test]
    fn bit_rendering() {
        let text = super::render_bits(0b101, 0b1);
        assert!(text.starts_with("X-x- "));
        assert_eq!(text.len(), 32 + 7);
    }
}
