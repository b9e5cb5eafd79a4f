//! Go-style duration strings.
//!
//! Config options that take a duration accept strings like `"90s"`,
//! `"250ms"` or `"1h2m3s"`. A duration is a possibly-fractional decimal
//! number with a unit suffix, repeated: `ns`, `us` (or `µs`), `ms`, `s`,
//! `m`, `h`. The bare string `"0"` is the zero duration; a number without
//! a unit is rejected.

use std::time::Duration;

use crate::{Error, Result};

fn unit_nanos(unit: &str) -> Option<u64> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

fn invalid(s: &str) -> Error {
    Error::Config(format!("invalid duration {s:?}"))
}

/// Parses a Go-style duration string into a `Duration`.
///
/// # Errors
///
/// Returns `Error::Config` for an empty string, a missing unit, an unknown
/// unit, or a value that overflows the nanosecond representation
/// (e.g. `"3000000h"`).
pub fn parse(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(invalid(s));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') || s.starts_with('+') {
        return Err(invalid(s));
    }

    let mut total_ns: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        // integer part
        let int_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let (int_part, after_int) = rest.split_at(int_len);
        // optional fraction
        let (frac_part, after_num) = if let Some(stripped) = after_int.strip_prefix('.') {
            let frac_len = stripped.chars().take_while(|c| c.is_ascii_digit()).count();
            let (f, tail) = stripped.split_at(frac_len);
            (f, tail)
        } else {
            ("", after_int)
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid(s));
        }
        // unit: everything up to the next digit
        let unit_len = after_num
            .chars()
            .take_while(|c| !c.is_ascii_digit())
            .map(char::len_utf8)
            .sum::<usize>();
        let (unit, tail) = after_num.split_at(unit_len);
        let scale = unit_nanos(unit).ok_or_else(|| invalid(s))?;

        let whole: u64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid(s))?
        };
        let mut component = whole
            .checked_mul(scale)
            .ok_or_else(|| Error::Config(format!("duration {s:?} out of range")))?;
        if !frac_part.is_empty() {
            // scale the fraction digit by digit so precision is exact for
            // power-of-ten unit scales
            let mut frac_scale = scale as f64;
            let mut frac_ns = 0.0;
            for c in frac_part.chars() {
                frac_scale /= 10.0;
                frac_ns += (c as u64 - '0' as u64) as f64 * frac_scale;
            }
            component = component
                .checked_add(frac_ns as u64)
                .ok_or_else(|| Error::Config(format!("duration {s:?} out of range")))?;
        }
        total_ns = total_ns
            .checked_add(component)
            .ok_or_else(|| Error::Config(format!("duration {s:?} out of range")))?;
        // guard against exceeding what callers can round-trip through i64
        if total_ns > i64::MAX as u64 {
            return Err(Error::Config(format!("duration {s:?} out of range")));
        }
        rest = tail;
    }
    Ok(Duration::from_nanos(total_ns))
}

/// Formats a duration in compact Go style (`"1h2m3.5s"`, `"250ms"`, `"0s"`).
pub fn format(d: Duration) -> String {
    let ns = d.as_nanos();
    if ns == 0 {
        return "0s".to_string();
    }
    if ns < 1_000 {
        return format!("{ns}ns");
    }
    if ns < 1_000_000 {
        return trim_unit(ns as f64 / 1_000.0, "µs");
    }
    if ns < 1_000_000_000 {
        return trim_unit(ns as f64 / 1_000_000.0, "ms");
    }
    let mut out = String::new();
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = (total_secs % 60) as f64 + f64::from(d.subsec_nanos()) / 1e9;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0.0 || out.is_empty() {
        out.push_str(&trim_unit(secs, "s"));
    }
    out
}

fn trim_unit(value: f64, unit: &str) -> String {
    let s = format!("{value:.9}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    format!("{s}{unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_units() {
        assert_eq!(parse("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse("100ns").unwrap(), Duration::from_nanos(100));
        assert_eq!(parse("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parses_compound_values() {
        assert_eq!(
            parse("1h2m3s4ms5us6ns").unwrap(),
            Duration::from_nanos(
                3_600_000_000_000 + 120_000_000_000 + 3_000_000_000 + 4_000_000 + 5_000 + 6
            )
        );
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn rejects_invalid_formats() {
        assert!(parse("").is_err());
        assert!(parse("3").is_err());
        assert!(parse("s").is_err());
        assert!(parse("3x").is_err());
        assert!(parse("-5s").is_err());
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse("3000000h").is_err());
        assert!(parse("99999999999999999999s").is_err());
    }

    #[test]
    fn formats_round_values() {
        assert_eq!(format(Duration::ZERO), "0s");
        assert_eq!(format(Duration::from_millis(250)), "250ms");
        assert_eq!(format(Duration::from_secs(90)), "1m30s");
        assert_eq!(format(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format(Duration::from_secs(7200)), "2h");
    }
}
