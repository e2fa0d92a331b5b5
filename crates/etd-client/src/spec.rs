//! Parses the positional source/destination arguments into either a
//! local filesystem path or a remote control-channel endpoint plus path,
//! e.g. `tcp://daemon.example.com:4004/data/x`.

use once_cell::sync::Lazy;
use regex::Regex;

use etd_core::sockname::EndpointUrl;

pub(crate) enum Location {
    Local(String),
    Remote { control: EndpointUrl, path: String },
}

static REMOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<proto>tcp6?|udt6?)://(?P<host>\[[^\]]*\]|[^/:]*)(?::(?P<port>\d+))?(?P<path>/.*)$")
        .unwrap()
});

pub(crate) fn parse(spec: &str) -> eyre::Result<Location> {
    let Some(caps) = REMOTE.captures(spec) else {
        return Ok(Location::Local(spec.to_string()));
    };
    let proto = &caps["proto"];
    let host = &caps["host"];
    let path = caps["path"].to_string();
    let url_str = match caps.name("port") {
        Some(p) => format!("{proto}://{host}:{}", p.as_str()),
        None => format!("{proto}://{host}"),
    };
    let control = EndpointUrl::parse(&url_str)
        .map_err(|e| eyre::eyre!("malformed control endpoint '{url_str}': {e}"))?;
    Ok(Location::Remote { control, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_has_no_scheme() {
        assert!(matches!(parse("/data/x").unwrap(), Location::Local(p) if p == "/data/x"));
    }

    #[test]
    fn remote_spec_splits_endpoint_from_path() {
        match parse("tcp://10.0.0.2:4004/out/x").unwrap() {
            Location::Remote { control, path } => {
                assert_eq!(control.host, "10.0.0.2");
                assert_eq!(control.port, Some(4004));
                assert_eq!(path, "/out/x");
            }
            _ => panic!("expected a remote location"),
        }
    }

    #[test]
    fn remote_spec_without_port_uses_default_later() {
        match parse("tcp://daemon.example.com/out/x").unwrap() {
            Location::Remote { control, path } => {
                assert_eq!(control.port, None);
                assert_eq!(path, "/out/x");
            }
            _ => panic!("expected a remote location"),
        }
    }
}
