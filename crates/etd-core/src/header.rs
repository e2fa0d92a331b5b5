//! The brace-delimited data-channel header (spec.md §4.6): `{ <k:v>,
//! <k:v>, ... }`, where a value is either a bare non-whitespace token or a
//! double-quoted string with backslash escapes. Required keys: `uuid`,
//! `sz`. Optional: `push`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EtdError, EtdResult};

#[derive(Debug, Clone)]
pub struct DataHeader {
    pub uuid: String,
    pub sz: u64,
    pub push: bool,
}

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?x)
        \s*
        (?P<key>[A-Za-z_][A-Za-z0-9_-]*)
        \s*:\s*
        (?:
            "(?P<qval>(?:[^"\\]|\\.)*)"
            |
            (?P<bval>[^,}\s]+)
        )
        \s*
    "#)
    .unwrap()
});

/// Parse `{ k:v, k:v, ... }`, returning the keys in a map plus the byte
/// offset just past the closing `}` (bytes after that point in the
/// caller's buffer are pull-direction payload, spec.md §4.6).
pub fn parse_header(buf: &[u8]) -> EtdResult<(HashMap<String, String>, usize)> {
    let open = buf
        .iter()
        .position(|&b| b == b'{')
        .ok_or_else(|| EtdError::Protocol("data header missing '{'".into()))?;
    let close = buf
        .iter()
        .position(|&b| b == b'}')
        .ok_or_else(|| EtdError::Protocol("data header missing '}'".into()))?;
    if close < open {
        return Err(EtdError::Protocol("data header braces out of order".into()));
    }

    let body = std::str::from_utf8(&buf[open + 1..close])
        .map_err(|_| EtdError::Protocol("data header is not valid UTF-8".into()))?;

    let mut fields = HashMap::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let rest = &body[pos..];
        if rest.trim_start().is_empty() {
            break;
        }
        let caps = TOKEN
            .captures(rest)
            .ok_or_else(|| EtdError::Protocol(format!("malformed data header token: {rest}")))?;
        let whole = caps.get(0).unwrap();
        if whole.start() != 0 {
            return Err(EtdError::Protocol(format!(
                "unexpected characters in data header: {rest}"
            )));
        }
        let key = caps["key"].to_string();
        let value = if let Some(q) = caps.name("qval") {
            unescape(q.as_str())
        } else {
            caps["bval"].to_string()
        };
        if fields.insert(key.clone(), value).is_some() {
            return Err(EtdError::Protocol(format!("duplicate header key '{key}'")));
        }

        pos += whole.end();
        let remainder = body[pos..].trim_start();
        if let Some(stripped) = remainder.strip_prefix(',') {
            pos = body.len() - stripped.len();
        } else {
            pos = body.len() - remainder.len();
        }
    }

    Ok((fields, close + 1))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn parse_data_header(buf: &[u8]) -> EtdResult<(DataHeader, usize)> {
    let (fields, after) = parse_header(buf)?;

    let uuid = fields
        .get("uuid")
        .ok_or_else(|| EtdError::Protocol("data header missing 'uuid'".into()))?
        .clone();
    let sz: u64 = fields
        .get("sz")
        .ok_or_else(|| EtdError::Protocol("data header missing 'sz'".into()))?
        .parse()
        .map_err(|_| EtdError::Protocol("data header 'sz' is not a number".into()))?;
    let push = match fields.get("push") {
        None => false,
        Some(v) if v == "1" => true,
        Some(other) => {
            return Err(EtdError::Protocol(format!(
                "data header has unsupported push value '{other}'"
            )))
        }
    };

    Ok((DataHeader { uuid, sz, push }, after))
}

/// Render the header this crate writes when initiating a data connection
/// (spec.md §4.3): `{ uuid:<u>, sz:<n>}` for a push, with `push:1` added
/// for a pull.
pub fn render_header(uuid: &str, sz: u64, push: bool) -> String {
    if push {
        format!("{{ uuid:{uuid}, push:1, sz:{sz}}}")
    } else {
        format!("{{ uuid:{uuid}, sz:{sz}}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_values() {
        let (header, after) = parse_data_header(b"{ uuid:abc-123, sz:1048576}").unwrap();
        assert_eq!(header.uuid, "abc-123");
        assert_eq!(header.sz, 1_048_576);
        assert!(!header.push);
        assert_eq!(&b"{ uuid:abc-123, sz:1048576}"[after..], b"");
    }

    #[test]
    fn parses_push_flag() {
        let (header, _) = parse_data_header(b"{ uuid:abc, push:1, sz:16}").unwrap();
        assert!(header.push);
    }

    #[test]
    fn rejects_bad_push_value() {
        assert!(parse_data_header(b"{ uuid:abc, push:2, sz:16}").is_err());
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert!(parse_data_header(b"{ uuid:abc, uuid:def, sz:16}").is_err());
    }

    #[test]
    fn trailing_bytes_after_close_brace_are_payload() {
        let buf = b"{ uuid:abc, sz:3}xyz";
        let (header, after) = parse_data_header(buf).unwrap();
        assert_eq!(header.sz, 3);
        assert_eq!(&buf[after..], b"xyz");
    }

    #[test]
    fn parses_quoted_value_with_escapes() {
        let (fields, _) = parse_header(br#"{ uuid:"a\"b", sz:1}"#).unwrap();
        assert_eq!(fields.get("uuid").unwrap(), "a\"b");
    }

    #[test]
    fn render_round_trips() {
        let header = render_header("u1", 100, false);
        let (parsed, _) = parse_data_header(header.as_bytes()).unwrap();
        assert_eq!(parsed.uuid, "u1");
        assert_eq!(parsed.sz, 100);
        assert!(!parsed.push);

        let push_header = render_header("u2", 50, true);
        let (parsed2, _) = parse_data_header(push_header.as_bytes()).unwrap();
        assert!(parsed2.push);
    }
}
