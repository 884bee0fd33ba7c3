//! File and device backed parameter types.

pub(crate) mod input;
pub(crate) mod led;
pub(crate) mod sysfs;
pub(crate) mod virtual_bit;

use std::path::Path;

use tracing::warn;

use crate::spec::leading_f64;

/// First integer found in a sysfs attribute.
pub(crate) fn read_int(path: &Path) -> std::io::Result<i64> {
    let text = std::fs::read_to_string(path)?;
    let start = text
        .find(|c: char| c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no number"))?;
    leading_f64(&text[start..])
        .map(|(value, _)| value.trunc() as i64)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no number"))
}

/// Read an integer attribute, falling back to `default` with a warning.
pub(crate) fn read_int_or(path: &Path, default: i64) -> i64 {
    match read_int(path) {
        Ok(value) => value,
        Err(err) => {
            warn!(target: "iopar.sysfs", path = %path.display(), %err, "using default {default}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_integer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attr");
        std::fs::write(&path, "temp: 42123\n").unwrap();
        assert_eq!(read_int(&path).unwrap(), 42123);
        std::fs::write(&path, "-7\n").unwrap();
        assert_eq!(read_int(&path).unwrap(), -7);
    }

    #[test]
    fn missing_attribute_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_int_or(&dir.path().join("nope"), 255), 255);
    }
}
