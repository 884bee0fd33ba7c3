//! Preset and const tables.
//!
//! Both are read from plain `key value` files:
//!
//! ```text
//! # comment
//! kitchen   led:kitchen
//! include   /etc/iopar/more.conf
//! ```
//!
//! The first definition of a key wins, so files loaded earlier (the
//! per-directory `.libio-*` file) shadow the system-wide ones.

use std::path::{Path, PathBuf};

use tracing::{info, trace, warn};

use crate::spec::parse_hms;

const MAX_INCLUDE_DEPTH: u32 = 10;

#[derive(Debug, Clone, Default)]
struct Table {
    entries: Vec<(String, String)>,
}

impl Table {
    fn load_files(paths: &[PathBuf]) -> Self {
        let mut table = Self::default();
        for path in paths {
            table.load_file(path, 0);
        }
        table
    }

    fn load_file(&mut self, path: &Path, depth: u32) {
        if depth > MAX_INCLUDE_DEPTH {
            warn!(target: "iopar.config", path = %path.display(), "includes nested too deep");
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(text) => self.parse_text(&text, &path.display().to_string(), depth),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(target: "iopar.config", path = %path.display(), %err, "cannot read"),
        }
    }

    fn parse_text(&mut self, text: &str, origin: &str, depth: u32) {
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let (Some(key), Some(value)) = (words.next(), words.next()) else {
                warn!(target: "iopar.config", origin, line = lineno + 1, "bad line");
                continue;
            };
            if key == "include" {
                self.load_file(Path::new(value), depth + 1);
                continue;
            }
            trace!(target: "iopar.config", origin, key, value, "entry");
            self.entries.push((key.to_owned(), value.to_owned()));
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

/// Named spec strings, resolved by `Io::create` for bare names.
#[derive(Debug, Clone, Default)]
pub struct Presets {
    table: Table,
}

impl Presets {
    /// Default search order: `.libio-presets`, then `/etc/libio-presets.conf`.
    #[must_use]
    pub fn default_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from(".libio-presets"),
            PathBuf::from("/etc/libio-presets.conf"),
        ]
    }

    /// Load every file in order; missing files are skipped silently.
    #[must_use]
    pub fn load_default(paths: &[PathBuf]) -> Self {
        Self {
            table: Table::load_files(paths),
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut table = Table::default();
        table.parse_text(text, "<string>", 0);
        Self { table }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.table.get(name)
    }

    /// Preset names in file order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys()
    }
}

/// Named constants: numbers, `H:M:S` durations in hours, or free text.
#[derive(Debug, Clone, Default)]
pub struct Consts {
    table: Table,
}

impl Consts {
    /// Default search order: `.libio-consts`, then `/etc/libio-consts.conf`.
    #[must_use]
    pub fn default_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from(".libio-consts"),
            PathBuf::from("/etc/libio-consts.conf"),
        ]
    }

    #[must_use]
    pub fn load_default(paths: &[PathBuf]) -> Self {
        Self {
            table: Table::load_files(paths),
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut table = Table::default();
        table.parse_text(text, "<string>", 0);
        Self { table }
    }

    /// Raw text of a const.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<&str> {
        self.table.get(name)
    }

    /// Numeric value, NaN when missing or not numeric.
    #[must_use]
    pub fn number(&self, name: &str) -> f64 {
        let Some(raw) = self.table.get(name) else {
            info!(target: "iopar.config", name, "const not found");
            return f64::NAN;
        };
        parse_hms(raw).unwrap_or(f64::NAN)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn comments_and_bad_lines_are_skipped() {
        let presets = Presets::parse("# lamps\nkitchen led:kitchen\nlonely\n\nhall\tvirtual:3\n");
        assert_eq!(presets.get("kitchen"), Some("led:kitchen"));
        assert_eq!(presets.get("hall"), Some("virtual:3"));
        assert_eq!(presets.get("lonely"), None);
        assert_eq!(presets.names().collect::<Vec<_>>(), vec!["kitchen", "hall"]);
    }

    #[test]
    fn first_definition_wins() {
        let presets = Presets::parse("x virtual:1\nx virtual:2\n");
        assert_eq!(presets.get("x"), Some("virtual:1"));
    }

    #[test]
    fn include_and_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("extra.conf");
        std::fs::File::create(&extra)
            .unwrap()
            .write_all(b"garage virtual:7\nkitchen virtual:9\n")
            .unwrap();
        let local = dir.path().join("local");
        let mut file = std::fs::File::create(&local).unwrap();
        writeln!(file, "kitchen led:kitchen").unwrap();
        writeln!(file, "include {}", extra.display()).unwrap();

        let missing = dir.path().join("missing");
        let presets = Presets::load_default(&[local, missing]);
        assert_eq!(presets.get("garage"), Some("virtual:7"));
        assert_eq!(presets.get("kitchen"), Some("led:kitchen"));
    }

    #[test]
    fn self_include_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.conf");
        std::fs::write(&path, format!("a 1\ninclude {}\n", path.display())).unwrap();
        let consts = Consts::load_default(&[path]);
        assert_eq!(consts.number("a"), 1.0);
    }

    #[test]
    fn consts_parse_numbers_and_durations() {
        let consts = Consts::parse("longpress 0.8\nwakeup 6:30\nname porch\n");
        assert_eq!(consts.number("longpress"), 0.8);
        assert_eq!(consts.number("wakeup"), 6.5);
        assert!(consts.number("name").is_nan());
        assert_eq!(consts.string("name"), Some("porch"));
        assert!(consts.number("absent").is_nan());
    }
}
