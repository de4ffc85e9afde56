//! Duration formatting and parsing.

use std::time::Duration;

const UNITS: [(&str, u128); 6] = [
    ("h", 3_600_000_000_000),
    ("m", 60_000_000_000),
    ("s", 1_000_000_000),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("ns", 1),
];

/// Formats `d` using its two most significant units, e.g. `1h2m` or `3s250ms`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let mut remaining = d.as_nanos();
    if remaining == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    let mut shown = 0;
    for (suffix, size) in UNITS {
        if shown == 2 {
            break;
        }
        let count = remaining / size;
        if count > 0 {
            out.push_str(&format!("{count}{suffix}"));
            remaining -= count * size;
            shown += 1;
        } else if shown > 0 {
            // units are consecutive: a zero after the first shown unit ends the output
            break;
        }
    }
    out
}

/// Parses durations like `10s`, `1m30s`, `500ms` or `2h`.
///
/// A bare number is read as seconds.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {text:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {text:?}"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration {text:?}"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let nanos = UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit)
            .map(|(_, size)| *size)
            .ok_or_else(|| format!("unknown unit {unit:?} in duration {text:?}"))?;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let part = Duration::from_nanos((value * nanos as f64) as u64);
        total += part;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_two_units() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m");
        assert_eq!(format_duration(Duration::from_millis(3250)), "3s250ms");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("s").is_err());
    }
}
