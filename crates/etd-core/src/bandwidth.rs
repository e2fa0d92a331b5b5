//! Bandwidth literal parsing (spec.md §6): `<int>` or
//! `<int>{k,M,G,T}{i,}{B,b}ps`. Lowercase `b` is bits, uppercase `B` is
//! bytes; an `i` before the unit selects base-1024 instead of base-1000.
//! Internal representation is always bytes/second; `-1` is the
//! "unlimited" sentinel.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EtdError, EtdResult};

/// Sentinel for "no cap" (spec.md §3, §6).
pub const UNLIMITED: i64 = -1;

static LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+)([kmgt])?(i)?([bB])ps$").unwrap());

/// Parse a bandwidth literal into bytes/second, or [`UNLIMITED`].
pub fn parse_bandwidth(literal: &str) -> EtdResult<i64> {
    let literal = literal.trim();
    if literal == "-1" {
        return Ok(UNLIMITED);
    }
    if let Ok(n) = literal.parse::<i64>() {
        return Ok(n);
    }

    let caps = LITERAL
        .captures(literal)
        .ok_or_else(|| EtdError::Protocol(format!("invalid bandwidth literal: {literal}")))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|_| EtdError::Protocol(format!("invalid bandwidth literal: {literal}")))?;
    let scale_exponent = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(s) if s == "k" => 1,
        Some(s) if s == "m" => 2,
        Some(s) if s == "g" => 3,
        Some(s) if s == "t" => 4,
        _ => 0,
    };
    let base: f64 = if caps.get(3).is_some() { 1024.0 } else { 1000.0 };
    // The unit letter's case is significant and regex is case-insensitive
    // overall, so recover it from the original literal rather than the match.
    let is_bits = caps[4] == *"b";

    let mut bytes_per_sec = value * base.powi(scale_exponent);
    if is_bits {
        bytes_per_sec /= 8.0;
    }
    Ok(bytes_per_sec.round() as i64)
}

/// Render bytes/second back into the shortest literal form, used for
/// diagnostics and config round-tripping. Always emits decimal (non-`i`)
/// byte units; this is a display convenience, not required to round-trip
/// through [`parse_bandwidth`] byte-for-byte across unit choices.
pub fn format_bandwidth(bytes_per_sec: i64) -> String {
    if bytes_per_sec == UNLIMITED {
        return "-1".to_string();
    }
    const UNITS: [(&str, i64); 4] = [
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("k", 1_000),
    ];
    for (suffix, scale) in UNITS {
        if bytes_per_sec >= scale && bytes_per_sec % scale == 0 {
            return format!("{}{}Bps", bytes_per_sec / scale, suffix);
        }
    }
    format!("{bytes_per_sec}Bps")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_sentinel() {
        assert_eq!(parse_bandwidth("-1").unwrap(), UNLIMITED);
    }

    #[test]
    fn bare_integer_is_bytes_per_second() {
        assert_eq!(parse_bandwidth("65536").unwrap(), 65536);
    }

    #[test]
    fn decimal_gigabit() {
        assert_eq!(parse_bandwidth("1Gbps").unwrap(), 125_000_000);
    }

    #[test]
    fn binary_gibibyte() {
        assert_eq!(parse_bandwidth("1GiBps").unwrap(), 1_073_741_824);
    }

    #[test]
    fn kilobyte_decimal() {
        assert_eq!(parse_bandwidth("1kBps").unwrap(), 1000);
    }

    #[test]
    fn megabit_binary() {
        assert_eq!(parse_bandwidth("8Mibps").unwrap(), 1_048_576);
    }

    #[test]
    fn format_round_trips_plain_units() {
        assert_eq!(format_bandwidth(UNLIMITED), "-1");
        assert_eq!(format_bandwidth(125_000_000), "125MBps");
        assert_eq!(format_bandwidth(42), "42Bps");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bandwidth("not-a-number").is_err());
    }
}
