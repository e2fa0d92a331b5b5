//! Size literal parsing for the synthetic `/dev/zero:<N>[kMGT][i]B`
//! endpoint (spec.md §4.1): `<N>` optionally followed by a decimal/binary
//! unit suffix, no bits-vs-bytes distinction (these are plain byte
//! counts, unlike the bandwidth literal in `crate::bandwidth`).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EtdError, EtdResult};

static SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\d+)([kmgt])?(i)?b?$").unwrap());

pub fn parse_size(literal: &str) -> EtdResult<u64> {
    let caps = SIZE
        .captures(literal.trim())
        .ok_or_else(|| EtdError::Protocol(format!("invalid size literal: {literal}")))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| EtdError::Protocol(format!("invalid size literal: {literal}")))?;
    let exponent = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(s) if s == "k" => 1,
        Some(s) if s == "m" => 2,
        Some(s) if s == "g" => 3,
        Some(s) if s == "t" => 4,
        _ => 0,
    };
    let base: f64 = if caps.get(3).is_some() { 1024.0 } else { 1000.0 };
    Ok((value * base.powi(exponent)).round() as u64)
}

const DEV_ZERO_PREFIX: &str = "/dev/zero:";

/// Is this path the synthetic `/dev/zero:<size>` endpoint?
pub fn is_dev_zero(path: &str) -> bool {
    path.starts_with(DEV_ZERO_PREFIX)
}

pub fn is_dev_null(path: &str) -> bool {
    path == "/dev/null"
}

/// Parse the size out of a `/dev/zero:<size>` path.
pub fn dev_zero_size(path: &str) -> EtdResult<u64> {
    let literal = path
        .strip_prefix(DEV_ZERO_PREFIX)
        .ok_or_else(|| EtdError::Protocol(format!("not a /dev/zero endpoint: {path}")))?;
    parse_size(literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_decimal_and_binary_units() {
        assert_eq!(parse_size("16MB").unwrap(), 16_000_000);
        assert_eq!(parse_size("16MiB").unwrap(), 16 * 1024 * 1024);
    }

    #[test]
    fn recognizes_dev_zero_paths() {
        assert!(is_dev_zero("/dev/zero:16MiB"));
        assert!(!is_dev_zero("/data/x"));
        assert_eq!(dev_zero_size("/dev/zero:16MiB").unwrap(), 16_777_216);
    }

    #[test]
    fn recognizes_dev_null() {
        assert!(is_dev_null("/dev/null"));
        assert!(!is_dev_null("/dev/null2"));
    }
}
