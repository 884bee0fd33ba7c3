//! Netio datagram text: newline separated lines.
//!
//! ```text
//! *keepalive        publisher to subscriber liveness
//! *subscribe        subscriber to publisher, registration and liveness
//! *initial          start of a full snapshot
//! name=value        value broadcast
//! name>value        write request
//! ```

use crate::spec::leading_f64;

/// Largest datagram we send or expect.
pub const MTU: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Line<'a> {
    Keepalive,
    Subscribe,
    Initial,
    Assign { name: &'a str, value: f64 },
    Write { name: &'a str, value: f64 },
    /// Unknown command or line without a value.
    Other(&'a str),
}

impl Line<'_> {
    fn parse(line: &str) -> Line<'_> {
        if let Some(command) = line.strip_prefix('*') {
            return match command {
                c if c.starts_with("keepalive") => Line::Keepalive,
                c if c.starts_with("subscribe") => Line::Subscribe,
                c if c.starts_with("initial") => Line::Initial,
                _ => Line::Other(line),
            };
        }
        let Some(at) = line.find(['=', '>']) else {
            return Line::Other(line);
        };
        let name = &line[..at];
        let value = leading_f64(&line[at + 1..]).map_or(f64::NAN, |(v, _)| v);
        if line.as_bytes()[at] == b'=' {
            Line::Assign { name, value }
        } else {
            Line::Write { name, value }
        }
    }
}

/// Split a received datagram into lines. Empty lines are skipped.
pub fn parse_packet(text: &str) -> impl Iterator<Item = Line<'_>> {
    text.split('\n')
        .filter(|line| !line.is_empty())
        .map(Line::parse)
}

/// Six decimals like `%lf`; NaN is spelled `nan`.
#[must_use]
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "nan".to_owned()
    } else if value == f64::INFINITY {
        "inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else {
        format!("{value:.6}")
    }
}

/// Accumulates lines into datagrams of at most [`MTU`] bytes.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    done: Vec<String>,
    current: String,
}

impl PacketBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line (without its newline).
    pub fn line(&mut self, line: &str) {
        if !self.current.is_empty() && self.current.len() + line.len() + 1 > MTU {
            self.done.push(std::mem::take(&mut self.current));
        }
        self.current.push_str(line);
        self.current.push('\n');
    }

    pub fn assign(&mut self, name: &str, value: f64) {
        self.line(&format!("{name}={}", format_value(value)));
    }

    pub fn write(&mut self, name: &str, value: f64) {
        self.line(&format!("{name}>{}", format_value(value)));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.done.is_empty() && self.current.is_empty()
    }

    #[must_use]
    pub fn finish(mut self) -> Vec<String> {
        if !self.current.is_empty() {
            self.done.push(self.current);
        }
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_line_kind() {
        let lines: Vec<Line<'_>> =
            parse_packet("*keepalive\n*subscribe\n*initial\nx=1.5\ny>-2\n*bogus\nnovalue\n\n").collect();
        assert_eq!(
            lines,
            vec![
                Line::Keepalive,
                Line::Subscribe,
                Line::Initial,
                Line::Assign { name: "x", value: 1.5 },
                Line::Write { name: "y", value: -2.0 },
                Line::Other("*bogus"),
                Line::Other("novalue"),
            ]
        );
    }

    #[test]
    fn nan_travels_as_text() {
        assert_eq!(format_value(f64::NAN), "nan");
        assert_eq!(format_value(1.5), "1.500000");
        let Some(Line::Assign { value, .. }) = parse_packet("x=nan").next() else {
            panic!("not an assignment");
        };
        assert!(value.is_nan());
    }

    #[test]
    fn garbage_value_reads_as_nan() {
        let Some(Line::Write { name, value }) = parse_packet("lamp>on").next() else {
            panic!("not a write");
        };
        assert_eq!(name, "lamp");
        assert!(value.is_nan());
    }

    #[test]
    fn large_batches_split_at_mtu() {
        let mut builder = PacketBuilder::new();
        for i in 0..200 {
            builder.assign(&format!("parameter_{i:03}"), f64::from(i));
        }
        let packets = builder.finish();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= MTU && p.ends_with('\n')));
        let total: usize = packets.iter().map(|p| parse_packet(p).count()).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn empty_builder_yields_nothing() {
        let builder = PacketBuilder::new();
        assert!(builder.is_empty());
        assert!(builder.finish().is_empty());
    }
}
