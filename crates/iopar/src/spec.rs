//! Small parsers shared by the spec-string constructors.

/// Parse the longest numeric prefix of `s` the way `strtod` would.
///
/// Leading whitespace is skipped. Accepts an optional sign, digits with an
/// optional fraction and exponent, and the words `nan`/`inf`/`infinity`
/// (case-insensitive). Returns the value and the unparsed rest.
#[must_use]
pub fn leading_f64(s: &str) -> Option<(f64, &str)> {
    let trimmed = s.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }

    let word = &trimmed[end..];
    for name in ["infinity", "inf", "nan"] {
        if word.len() >= name.len() && word[..name.len()].eq_ignore_ascii_case(name) {
            let len = end + name.len();
            let value = trimmed[..len].to_ascii_lowercase().parse::<f64>().ok()?;
            return Some((value, &trimmed[len..]));
        }
    }

    let digits_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut mantissa = end - digits_start;
    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while bytes.get(frac_end).is_some_and(u8::is_ascii_digit) {
            frac_end += 1;
        }
        mantissa += frac_end - frac_start;
        if mantissa > 0 {
            end = frac_end;
        }
    }
    if mantissa == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    let value = trimmed[..end].parse::<f64>().ok()?;
    Some((value, &trimmed[end..]))
}

/// Parse a whole string as a number, allowing surrounding whitespace.
#[must_use]
pub fn parse_f64(s: &str) -> Option<f64> {
    match leading_f64(s) {
        Some((value, rest)) if rest.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Parse a number or an `H:M:S` / `H:M` duration expressed in hours.
#[must_use]
pub fn parse_hms(s: &str) -> Option<f64> {
    let (mut value, rest) = leading_f64(s)?;
    if let Some(rest) = rest.strip_prefix(':') {
        let (minutes, rest) = leading_f64(rest).unwrap_or((0.0, rest));
        value += minutes / 60.0;
        if let Some(rest) = rest.strip_prefix(':') {
            let (seconds, _) = leading_f64(rest).unwrap_or((0.0, rest));
            value += seconds / 3600.0;
        }
    }
    Some(value)
}

/// One `key` or `key=value` entry of a comma separated option list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubOpt<'a> {
    pub key: &'a str,
    pub value: Option<&'a str>,
}

/// Split `a=1,b,c=x` into [`SubOpt`]s, skipping empty entries.
pub fn subopts(s: &str) -> impl Iterator<Item = SubOpt<'_>> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) => SubOpt {
                key: key.trim(),
                value: Some(value.trim()),
            },
            None => SubOpt {
                key: item,
                value: None,
            },
        })
}
