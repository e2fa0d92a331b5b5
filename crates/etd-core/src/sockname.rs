//! Endpoint descriptors ("socknames", spec.md §3/§6): the wire
//! representation of one end of a connection, and the listen/connect URL
//! syntax accepted on the command line and in config files.

use std::fmt;
use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EtdError, EtdResult};

/// Transport family. UDT's two protocol tags (`Udt`/`Udt6`) exist at this
/// layer as first-class values even though the channel underneath them is
/// a tuned TCP stream — see `crate::channel` module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Tcp6,
    Udt,
    Udt6,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tcp6 => "tcp6",
            Protocol::Udt => "udt",
            Protocol::Udt6 => "udt6",
        }
    }

    pub fn is_ipv6(self) -> bool {
        matches!(self, Protocol::Tcp6 | Protocol::Udt6)
    }

    pub fn is_udt(self) -> bool {
        matches!(self, Protocol::Udt | Protocol::Udt6)
    }

    pub fn parse(s: &str) -> EtdResult<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "tcp6" => Ok(Protocol::Tcp6),
            "udt" => Ok(Protocol::Udt),
            "udt6" => Ok(Protocol::Udt6),
            other => Err(EtdError::Resolution(format!(
                "unknown transport protocol '{other}'"
            ))),
        }
    }

    pub const fn default_control_port() -> u16 {
        4004
    }

    pub const fn default_data_port() -> u16 {
        8008
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `mss ∈ {0} ∪ [64,65536]`, `0` meaning "unset".
pub type Mss = u32;
/// `max_bw ∈ {-1} ∪ [1, ..]`, `-1` meaning "unlimited".
pub type MaxBw = i64;

/// The `(protocol, host, port, mss, max_bw)` tuple of spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sockname {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub mss: Option<Mss>,
    pub max_bw: Option<MaxBw>,
}

impl Sockname {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            mss: None,
            max_bw: None,
        }
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Protocol v0 wire form: `<proto/host:port>`.
    pub fn encode_v0(&self) -> String {
        format!("<{}/{}:{}>", self.protocol, self.bracketed_host(), self.port)
    }

    /// Protocol v1 wire form: `<proto/host:port/mss=M,max-bw=B>`.
    pub fn encode_v1(&self) -> String {
        format!(
            "<{}/{}:{}/mss={},max-bw={}>",
            self.protocol,
            self.bracketed_host(),
            self.port,
            self.mss.unwrap_or(0),
            self.max_bw.unwrap_or(-1),
        )
    }

    /// Encode at whichever protocol version the peer speaks.
    pub fn encode_for_version(&self, version: u32) -> String {
        if version >= 1 {
            self.encode_v1()
        } else {
            self.encode_v0()
        }
    }

    /// Parse either wire form back into a [`Sockname`] (spec.md §8,
    /// invariant 4: round-trips exactly for the fields each version
    /// carries).
    pub fn parse(text: &str) -> EtdResult<Self> {
        static SOCKNAME: Lazy<Regex> = Lazy::new(|| {
            Regex::new(
                r"(?x)
                ^<
                (?P<proto>[a-z0-9]+)
                /
                (?P<host>\[[^\]]+\]|[^:]+)
                :
                (?P<port>\d+)
                (?:/mss=(?P<mss>\d+),max-bw=(?P<maxbw>-?\d+))?
                >$",
            )
            .unwrap()
        });

        let caps = SOCKNAME
            .captures(text.trim())
            .ok_or_else(|| EtdError::Protocol(format!("malformed sockname: {text}")))?;

        let protocol = Protocol::parse(&caps["proto"])?;
        let raw_host = &caps["host"];
        let host = raw_host
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(raw_host)
            .to_string();
        let port: u16 = caps["port"]
            .parse()
            .map_err(|_| EtdError::Protocol(format!("malformed sockname port: {text}")))?;

        let (mss, max_bw) = match (caps.name("mss"), caps.name("maxbw")) {
            (Some(m), Some(b)) => {
                let mss: u32 = m
                    .as_str()
                    .parse()
                    .map_err(|_| EtdError::Protocol(format!("malformed sockname mss: {text}")))?;
                let max_bw: i64 = b.as_str().parse().map_err(|_| {
                    EtdError::Protocol(format!("malformed sockname max-bw: {text}"))
                })?;
                (
                    if mss == 0 { None } else { Some(mss) },
                    if max_bw == -1 { None } else { Some(max_bw) },
                )
            }
            _ => (None, None),
        };

        Ok(Sockname {
            protocol,
            host,
            port,
            mss,
            max_bw,
        })
    }
}

impl fmt::Display for Sockname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode_v1())
    }
}

/// `-1` sentinel used for "leave untouched"/unlimited bandwidth.
pub const UNLIMITED_BW: i64 = -1;

/// `UDT_MSS = min(ourMSS, peerMSS)` using only sides that have it set; if
/// neither sets it, the default MSS applies (spec.md §4.3).
pub fn negotiate_mss(ours: Option<Mss>, peer: Option<Mss>, default: Mss) -> Mss {
    match (ours, peer) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => default,
    }
}

/// `UDT_MAXBW = min(ourBW, peerBW)`; if either side is unset, use the
/// other; if neither is set, unlimited (spec.md §4.3).
pub fn negotiate_max_bw(ours: Option<MaxBw>, peer: Option<MaxBw>) -> MaxBw {
    let cap = |v: MaxBw| if v == UNLIMITED_BW { i64::MAX } else { v };
    match (ours, peer) {
        (Some(a), Some(b)) => {
            let capped = cap(a).min(cap(b));
            if capped == i64::MAX {
                UNLIMITED_BW
            } else {
                capped
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => UNLIMITED_BW,
    }
}

/// Split the `//host%scope/prefixlen` shape used by endpoint URLs, honoring
/// the `%iface` scope-id suffix for link-local IPv6 literals.
pub fn split_host_scope(host: &str) -> (&str, Option<&str>) {
    match host.split_once('%') {
        Some((h, scope)) => (h, Some(scope)),
        None => (host, None),
    }
}

pub fn host_is_ipv6_literal(host: &str) -> bool {
    let (bare, _) = split_host_scope(host);
    bare.parse::<IpAddr>()
        .map(|addr| addr.is_ipv6())
        .unwrap_or(false)
}

/// An endpoint URL: `(tcp|tcp6|udt|udt6)://[host][:port]` (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    pub protocol: Protocol,
    pub host: String,
    pub port: Option<u16>,
}

impl EndpointUrl {
    pub fn parse(raw: &str) -> EtdResult<Self> {
        static URL: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(?P<proto>[a-z0-9]+)://(?P<host>\[[^\]]*\]|[^:]*)(?::(?P<port>\d+))?$")
                .unwrap()
        });
        let caps = URL
            .captures(raw.trim())
            .ok_or_else(|| EtdError::Resolution(format!("malformed endpoint URL: {raw}")))?;

        let protocol = Protocol::parse(&caps["proto"])?;
        let raw_host = &caps["host"];
        let host = raw_host
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(raw_host)
            .to_string();
        let port = caps
            .name("port")
            .map(|m| m.as_str().parse::<u16>())
            .transpose()
            .map_err(|_| EtdError::Resolution(format!("malformed endpoint URL port: {raw}")))?;

        Ok(EndpointUrl {
            protocol,
            host,
            port,
        })
    }

    pub fn port_or_default(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v0_round_trip_drops_mss_and_bw() {
        let sn = Sockname::new(Protocol::Tcp, "10.0.0.2", 8008);
        let encoded = sn.encode_v0();
        assert_eq!(encoded, "<tcp/10.0.0.2:8008>");
        let decoded = Sockname::parse(&encoded).unwrap();
        assert_eq!(decoded.protocol, Protocol::Tcp);
        assert_eq!(decoded.host, "10.0.0.2");
        assert_eq!(decoded.port, 8008);
        assert_eq!(decoded.mss, None);
        assert_eq!(decoded.max_bw, None);
    }

    #[test]
    fn v1_round_trip_is_exact() {
        let mut sn = Sockname::new(Protocol::Udt, "10.0.0.2", 8008);
        sn.mss = Some(1400);
        sn.max_bw = Some(125_000_000);
        let encoded = sn.encode_v1();
        assert_eq!(encoded, "<udt/10.0.0.2:8008/mss=1400,max-bw=125000000>");
        let decoded = Sockname::parse(&encoded).unwrap();
        assert_eq!(decoded, sn);
    }

    #[test]
    fn ipv6_is_bracketed() {
        let sn = Sockname::new(Protocol::Tcp6, "::1", 4004);
        assert_eq!(sn.encode_v0(), "<tcp6/[::1]:4004>");
        let decoded = Sockname::parse(&sn.encode_v0()).unwrap();
        assert_eq!(decoded.host, "::1");
    }

    #[test]
    fn endpoint_url_defaults_and_ipv6() {
        let url = EndpointUrl::parse("tcp://0:4004").unwrap();
        assert_eq!(url.protocol, Protocol::Tcp);
        assert_eq!(url.host, "0");
        assert_eq!(url.port, Some(4004));

        let url = EndpointUrl::parse("udt6://[::]:8008").unwrap();
        assert_eq!(url.protocol, Protocol::Udt6);
        assert_eq!(url.host, "::");
        assert_eq!(url.port, Some(8008));

        let url = EndpointUrl::parse("tcp://").unwrap();
        assert_eq!(url.host, "");
        assert_eq!(url.port_or_default(Protocol::default_control_port()), 4004);
    }

    #[test]
    fn scope_id_suffix_is_split_off() {
        let (host, scope) = split_host_scope("fe80::1%eth0");
        assert_eq!(host, "fe80::1");
        assert_eq!(scope, Some("eth0"));
    }
}
