//! Parsing utilities for human-friendly durations.

use std::time::Duration;

use crate::{Error, Result};

/// Parse a duration such as `"30s"`, `"5m"`, `"1h30m"`, or `"250ms"`.
///
/// Supported units: `ms`, `s`, `m`, `h`, `d`. Components may be chained and
/// are summed. A bare `0` is accepted and means "no duration".
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::message("empty duration string"));
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::message(format!("duration missing unit suffix: {input}")))?;
        if digits == 0 {
            return Err(Error::message(format!("invalid duration: {input}")));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::message(format!("invalid number in duration: {input}")))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3_600),
            "d" => Duration::from_secs(value * 86_400),
            _ => {
                return Err(Error::message(format!(
                    "unknown duration unit '{unit}' in {input} (expected ms/s/m/h/d)"
                )));
            },
        };
    }

    Ok(total)
}

/// Render a duration the way [`parse_duration`] reads it, e.g. `1h30m`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    let millis = duration.subsec_millis();
    if secs == 0 {
        return format!("{millis}ms");
    }

    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    if millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("30s", Duration::from_secs(30))]
    #[case("5m", Duration::from_secs(300))]
    #[case("2h", Duration::from_secs(7_200))]
    #[case("1d", Duration::from_secs(86_400))]
    #[case("1h30m", Duration::from_secs(5_400))]
    #[case("250ms", Duration::from_millis(250))]
    #[case("  10m  ", Duration::from_secs(600))]
    #[case("0", Duration::ZERO)]
    fn parses(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("100")]
    #[case("10x")]
    #[case("m")]
    fn rejects(#[case] input: &str) {
        assert!(parse_duration(input).is_err());
    }

    #[test]
    fn formats_compound_durations() {
        assert_eq!(format_duration(Duration::from_secs(5_400)), "1h30m");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1s500ms");
        assert_eq!(format_duration(Duration::from_millis(20)), "20ms");
    }
}
