//! Endpoint factories (spec.md §4.2): `mk_server`/`mk_client` turn an
//! [`EndpointUrl`] plus a [`SocketSettings`] bundle into a bound listener
//! or a connected channel.
//!
//! Per the REDESIGN FLAG in spec.md §9, the variadic-template/tag-type
//! option bundle of the original is replaced with a plain
//! struct-of-optionals: `SocketSettings`. Every field is independently
//! settable and every setting is named and typed.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::SockAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use crate::channel::{apply_buffer_sizes, domain_for, new_tcp_socket, Channel, Listener, UdtParams};
use crate::error::{EtdError, EtdResult};
use crate::sockname::{EndpointUrl, Protocol};

/// Struct-of-optionals socket tuning bundle shared by server and client
/// construction (spec.md §4.2, §9).
#[derive(Debug, Clone, Default)]
pub struct SocketSettings {
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
    pub backlog: Option<u32>,
    pub udt_mss: Option<u32>,
    pub udt_max_bw: Option<i64>,
    pub udt_linger: Option<Duration>,
    /// Number of connect retries for client construction. Default policy
    /// (spec.md §4.2) is 0 for TCP, 2 for UDT, spaced 5s apart.
    pub n_retry: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl SocketSettings {
    fn default_retry(&self, protocol: Protocol) -> (u32, Duration) {
        let default_n = if protocol.is_udt() { 2 } else { 0 };
        let default_delay = Duration::from_secs(5);
        (
            self.n_retry.unwrap_or(default_n),
            self.retry_delay.unwrap_or(default_delay),
        )
    }

    fn udt_params(&self) -> UdtParams {
        UdtParams {
            mss: self.udt_mss.unwrap_or(1500),
            max_bw: self.udt_max_bw.unwrap_or(-1),
        }
    }

    /// `UDT_FC`: flow-control window in MSS-sized packets (spec.md §4.2).
    pub fn udt_flow_control_window(&self) -> u32 {
        let mss = self.udt_mss.unwrap_or(1500).max(29);
        let recv = self.recv_buffer.unwrap_or(1 << 20) as u32;
        recv.div_ceil(mss - 28) + 256
    }
}

async fn resolve_host(host: &str, protocol: Protocol) -> EtdResult<IpAddr> {
    if host.is_empty() {
        return Ok(if protocol.is_ipv6() {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
        });
    }
    if host == "0" {
        return Ok(if protocol.is_ipv6() {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
        });
    }
    let (bare, _scope) = crate::sockname::split_host_scope(host);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ip);
    }
    let lookup = format!("{bare}:0");
    tokio::net::lookup_host(&lookup)
        .await
        .map_err(|e| EtdError::Resolution(format!("cannot resolve host '{host}': {e}")))?
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| EtdError::Resolution(format!("no addresses for host '{host}'")))
}

/// Create a listening endpoint (spec.md §4.2, "Server construction").
pub async fn mk_server(url: &EndpointUrl, settings: &SocketSettings, default_port: u16) -> EtdResult<Listener> {
    let ip = resolve_host(&url.host, url.protocol).await?;
    let port = url.port_or_default(default_port);
    let addr = SocketAddr::new(ip, port);

    let socket = new_tcp_socket(url.protocol)?;
    socket.set_reuse_address(true)?;
    apply_buffer_sizes(&socket, settings.send_buffer, settings.recv_buffer)?;
    if url.protocol.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(settings.backlog.unwrap_or(128) as i32)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    let params = settings.udt_params();
    Ok(match url.protocol {
        Protocol::Tcp => Listener::Tcp(listener),
        Protocol::Tcp6 => Listener::Tcp6(listener),
        Protocol::Udt => Listener::Udt(listener, params),
        Protocol::Udt6 => Listener::Udt6(listener, params),
    })
}

/// A cooperative cancellation probe consulted between connect retries.
/// The control/data wrappers hand in a closure backed by the shared
/// `cancelled` flag (spec.md §4.2, §5).
pub type CancelProbe<'a> = &'a (dyn Fn() -> bool + Sync);

/// Create a connected client endpoint (spec.md §4.2, "Client
/// construction"), including the bounded connect-retry loop.
pub async fn mk_client(
    url: &EndpointUrl,
    settings: &SocketSettings,
    default_port: u16,
    cancel: CancelProbe<'_>,
) -> EtdResult<Channel> {
    if url.host.is_empty() {
        return Err(EtdError::Resolution(
            "client endpoint requires a non-empty host".into(),
        ));
    }
    let ip = resolve_host(&url.host, url.protocol).await?;
    let port = url.port_or_default(default_port);
    let addr = SocketAddr::new(ip, port);

    let (n_retry, retry_delay) = settings.default_retry(url.protocol);
    let mut attempt = 0u32;
    loop {
        let socket = new_tcp_socket(url.protocol)?;
        apply_buffer_sizes(&socket, settings.send_buffer, settings.recv_buffer)?;

        match connect_socket(socket, addr).await {
            Ok(stream) => {
                return Ok(Channel::from_stream(url.protocol, stream, settings.udt_params()));
            }
            Err(err) => {
                if cancel() {
                    return Err(EtdError::Cancelled);
                }
                if attempt >= n_retry {
                    return Err(EtdError::Io(err));
                }
                attempt += 1;
                sleep(retry_delay).await;
            }
        }
    }
}

/// Connect with the socket still in its default blocking mode, so
/// `connect()` itself waits for the handshake to finish instead of
/// returning `EINPROGRESS` (which a non-blocking connect would, since
/// nothing here polls for writability / checks `SO_ERROR`). Only once
/// the connection is established is the socket switched to non-blocking
/// and handed to tokio, matching `TcpStream::connect`'s own internal
/// connect-then-register ordering (spec.md §4.2).
async fn connect_socket(socket: socket2::Socket, addr: SocketAddr) -> io::Result<TcpStream> {
    let std_stream: std::net::TcpStream =
        tokio::task::spawn_blocking(move || -> io::Result<std::net::TcpStream> {
            socket.connect(&SockAddr::from(addr))?;
            Ok(socket.into())
        })
        .await
        .map_err(|e| io::Error::other(format!("connect task panicked: {e}")))??;
    std_stream.set_nonblocking(true)?;
    TcpStream::from_std(std_stream)
}

/// Resolve an endpoint whose `Domain` has already been decided elsewhere
/// (used by tests that want to avoid relying on network name resolution).
pub fn domain_of(protocol: Protocol) -> socket2::Domain {
    domain_for(protocol)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_cancel() -> bool {
        false
    }

    #[tokio::test]
    async fn server_then_client_round_trip() {
        let url = EndpointUrl::parse("tcp://127.0.0.1:0").unwrap();
        let listener = mk_server(&url, &SocketSettings::default(), 0).await.unwrap();
        let bound = listener.getsockname().unwrap();

        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });

        let client_url = EndpointUrl::parse(&format!("tcp://127.0.0.1:{}", bound.port)).unwrap();
        let cancel: CancelProbe = &never_cancel;
        let mut client = mk_client(&client_url, &SocketSettings::default(), 0, cancel)
            .await
            .unwrap();

        let mut server_channel = accept_task.await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let mut total = 0;
        while total < 5 {
            let n = server_channel.read(&mut buf[total..]).await.unwrap();
            assert!(n > 0);
            total += n;
        }
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn client_rejects_empty_host() {
        let url = EndpointUrl::parse("tcp://:4004").unwrap();
        let cancel: CancelProbe = &never_cancel;
        let err = mk_client(&url, &SocketSettings::default(), 4004, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EtdError::Resolution(_)));
    }

    #[test]
    fn flow_control_window_matches_formula() {
        let settings = SocketSettings {
            recv_buffer: Some(1 << 20),
            udt_mss: Some(1500),
            ..Default::default()
        };
        let fc = settings.udt_flow_control_window();
        let expected = (1u32 << 20).div_ceil(1500 - 28) + 256;
        assert_eq!(fc, expected);
    }
}
