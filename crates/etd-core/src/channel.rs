//! The FD abstraction (spec.md §4.1), reworked per the REDESIGN FLAG in
//! spec.md §9: rather than eight individually-settable callables bolted
//! onto a handle, every endpoint kind is a variant of a closed enum. Each
//! variant carries exactly the state its kind needs; dispatch is a
//! `match`, not a vtable.
//!
//! UDT channels are the one place this implementation departs from a
//! literal reading of the original: there is no UDT crate anywhere in the
//! Rust ecosystem this corpus draws from, and spec.md §1 already treats
//! the UDT library as an external collaborator. `Udt`/`Udt6` channels are
//! therefore backed by a tuned `tokio::net::TcpStream`, carrying the
//! negotiated MSS (used as the copy-loop chunk size, standing in for the
//! UDT wire segment size) and max-bandwidth (enforced with an
//! application-level token-bucket limiter on the write path, since there
//! is no real UDT socket option to set). See DESIGN.md.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::error::{EtdError, EtdResult};
use crate::sockname::{Protocol, Sockname};

/// Negotiated transport parameters applied to a UDT-tagged channel.
#[derive(Debug, Clone, Copy)]
pub struct UdtParams {
    pub mss: u32,
    pub max_bw: i64,
}

impl Default for UdtParams {
    fn default() -> Self {
        Self {
            mss: 1500,
            max_bw: -1,
        }
    }
}

/// Simple token-bucket limiter standing in for `UDT_MAXBW`. `-1` means
/// unlimited and `throttle` is then a no-op.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterState>>,
}

#[derive(Debug)]
struct RateLimiterState {
    max_bytes_per_sec: i64,
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_bytes_per_sec: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateLimiterState {
                max_bytes_per_sec,
                available: max_bytes_per_sec.max(0) as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub async fn throttle(&self, n: usize) {
        loop {
            let wait = {
                let mut state = self.inner.lock();
                if state.max_bytes_per_sec < 0 {
                    return;
                }
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.available =
                    (state.available + elapsed * state.max_bytes_per_sec as f64)
                        .min(state.max_bytes_per_sec as f64);
                state.last_refill = now;

                if state.available >= n as f64 {
                    state.available -= n as f64;
                    return;
                }
                let deficit = n as f64 - state.available;
                Duration::from_secs_f64(deficit / state.max_bytes_per_sec.max(1) as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// A connected, readable/writable endpoint — one variant per concrete
/// kind listed in spec.md §2 item 1.
pub enum Channel {
    Tcp(TcpStream),
    Tcp6(TcpStream),
    Udt(TcpStream, UdtParams, RateLimiter),
    Udt6(TcpStream, UdtParams, RateLimiter),
    File(File),
    /// Read side: yields unspecified bytes until `remaining` reaches zero.
    DevZero(u64),
    /// Write side: accepts and discards unlimited bytes.
    DevNull,
}

impl Channel {
    pub fn from_stream(protocol: Protocol, stream: TcpStream, params: UdtParams) -> Self {
        match protocol {
            Protocol::Tcp => Channel::Tcp(stream),
            Protocol::Tcp6 => Channel::Tcp6(stream),
            Protocol::Udt => Channel::Udt(stream, params, RateLimiter::new(params.max_bw)),
            Protocol::Udt6 => Channel::Udt6(stream, params, RateLimiter::new(params.max_bw)),
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Channel::Tcp(_) => Some(Protocol::Tcp),
            Channel::Tcp6(_) => Some(Protocol::Tcp6),
            Channel::Udt(..) => Some(Protocol::Udt),
            Channel::Udt6(..) => Some(Protocol::Udt6),
            Channel::File(_) | Channel::DevZero(_) | Channel::DevNull => None,
        }
    }

    /// `read(fd, buf, n)`: `>0` bytes read, `0` clean EOF, error otherwise.
    /// UDT "connection lost" and `EASYNCRCV` soft conditions have no
    /// literal analogue over TCP; the mapping collapses to the standard
    /// `Ok(0)` on orderly shutdown that `tokio::net::TcpStream` already
    /// gives us.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Tcp(s) | Channel::Tcp6(s) => s.read(buf).await,
            Channel::Udt(s, ..) | Channel::Udt6(s, ..) => s.read(buf).await,
            Channel::File(f) => f.read(buf).await,
            Channel::DevZero(remaining) => {
                let n = buf.len().min(*remaining as usize);
                buf[..n].fill(0);
                *remaining -= n as u64;
                Ok(n)
            }
            Channel::DevNull => Ok(0),
        }
    }

    /// `write(fd, buf, n)`: `>0` bytes written. `0` never expected from a
    /// real endpoint; callers treat a `0`-byte write as a protocol error.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Tcp(s) | Channel::Tcp6(s) => s.write(buf).await,
            Channel::Udt(s, _, limiter) | Channel::Udt6(s, _, limiter) => {
                limiter.throttle(buf.len()).await;
                s.write(buf).await
            }
            Channel::File(f) => f.write(buf).await,
            Channel::DevZero(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "/dev/zero is read-only",
            )),
            Channel::DevNull => Ok(buf.len()),
        }
    }

    /// Write the whole buffer, looping past partial/zero writes the way a
    /// byte-stream socket can legitimately produce.
    pub async fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0 bytes",
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// `close(fd)`: idempotent — dropping the variant's underlying
    /// resource is itself idempotent in Rust (a second close is a no-op),
    /// satisfying the cancellation-path re-entrance requirement.
    pub async fn close(&mut self) {
        match self {
            Channel::Tcp(s) | Channel::Tcp6(s) | Channel::Udt(s, ..) | Channel::Udt6(s, ..) => {
                let _ = s.shutdown().await;
            }
            Channel::File(f) => {
                let _ = f.flush().await;
            }
            Channel::DevZero(_) | Channel::DevNull => {}
        }
    }

    /// `lseek`: meaningful only for files and the synthetic endpoints.
    pub async fn lseek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        use tokio::io::AsyncSeekExt;
        match self {
            Channel::File(f) => f.seek(pos).await,
            Channel::DevZero(remaining) => match pos {
                io::SeekFrom::Start(n) => {
                    *remaining = remaining.saturating_sub(n);
                    Ok(n)
                }
                _ => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "only SeekFrom::Start is meaningful on /dev/zero",
                )),
            },
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "lseek is only meaningful for files and synthetic endpoints",
            )),
        }
    }

    pub fn getpeername(&self) -> EtdResult<Sockname> {
        Self::describe(self, |s| s.peer_addr(), "getpeername")
    }

    pub fn getsockname(&self) -> EtdResult<Sockname> {
        Self::describe(self, |s| s.local_addr(), "getsockname")
    }

    fn describe(
        &self,
        addr_of: impl Fn(&TcpStream) -> io::Result<std::net::SocketAddr>,
        op: &str,
    ) -> EtdResult<Sockname> {
        let build = |protocol: Protocol, s: &TcpStream, params: Option<&UdtParams>| {
            let addr = addr_of(s)?;
            let mut sn = Sockname::new(protocol, addr.ip().to_string(), addr.port());
            if let Some(p) = params {
                sn.mss = Some(p.mss);
                sn.max_bw = Some(p.max_bw);
            }
            Ok::<_, io::Error>(sn)
        };
        match self {
            Channel::Tcp(s) => Ok(build(Protocol::Tcp, s, None)?),
            Channel::Tcp6(s) => Ok(build(Protocol::Tcp6, s, None)?),
            Channel::Udt(s, params, _) => Ok(build(Protocol::Udt, s, Some(params))?),
            Channel::Udt6(s, params, _) => Ok(build(Protocol::Udt6, s, Some(params))?),
            _ => Err(EtdError::Protocol(format!(
                "{op} is only meaningful for network channels"
            ))),
        }
    }

    /// `setblocking(fd, bool)`. Tokio sockets are always OS-nonblocking and
    /// multiplexed by the runtime; there is nothing to toggle. Kept as an
    /// explicit no-op (rather than omitted) so call sites that mirror the
    /// original control flow (e.g. "set blocking before handing the FD to
    /// the accept loop") still read the same way.
    pub fn set_blocking(&self, _blocking: bool) {}

    /// Unwrap a network-backed channel into its raw stream, e.g. so a
    /// caller can split it into independent read/write halves. Returns
    /// the channel back unchanged if it isn't one of the TCP/UDT variants.
    pub fn into_tcp_stream(self) -> Result<TcpStream, Self> {
        match self {
            Channel::Tcp(s) | Channel::Tcp6(s) | Channel::Udt(s, ..) | Channel::Udt6(s, ..) => {
                Ok(s)
            }
            other => Err(other),
        }
    }

    /// The chunk size the copy loop should use when reading from this
    /// channel: the negotiated MSS minus protocol overhead for UDT-tagged
    /// channels, `bufSize` otherwise (the caller supplies `buf_size` as
    /// the fallback).
    pub fn preferred_chunk_size(&self, buf_size: usize) -> usize {
        match self {
            Channel::Udt(_, params, _) | Channel::Udt6(_, params, _) if params.mss > 28 => {
                (params.mss - 28) as usize
            }
            _ => buf_size,
        }
    }
}

/// A listening endpoint, the server-side counterpart of [`Channel`].
pub enum Listener {
    Tcp(TcpListener),
    Tcp6(TcpListener),
    Udt(TcpListener, UdtParams),
    Udt6(TcpListener, UdtParams),
}

impl Listener {
    pub fn protocol(&self) -> Protocol {
        match self {
            Listener::Tcp(_) => Protocol::Tcp,
            Listener::Tcp6(_) => Protocol::Tcp6,
            Listener::Udt(..) => Protocol::Udt,
            Listener::Udt6(..) => Protocol::Udt6,
        }
    }

    /// `accept(fd)`: returns a new channel of the same protocol family.
    pub async fn accept(&self) -> io::Result<Channel> {
        match self {
            Listener::Tcp(l) => Ok(Channel::Tcp(l.accept().await?.0)),
            Listener::Tcp6(l) => Ok(Channel::Tcp6(l.accept().await?.0)),
            Listener::Udt(l, params) => {
                let (stream, _) = l.accept().await?;
                Ok(Channel::Udt(stream, *params, RateLimiter::new(params.max_bw)))
            }
            Listener::Udt6(l, params) => {
                let (stream, _) = l.accept().await?;
                Ok(Channel::Udt6(stream, *params, RateLimiter::new(params.max_bw)))
            }
        }
    }

    pub fn getsockname(&self) -> EtdResult<Sockname> {
        let (protocol, addr, params) = match self {
            Listener::Tcp(l) => (Protocol::Tcp, l.local_addr()?, None),
            Listener::Tcp6(l) => (Protocol::Tcp6, l.local_addr()?, None),
            Listener::Udt(l, p) => (Protocol::Udt, l.local_addr()?, Some(*p)),
            Listener::Udt6(l, p) => (Protocol::Udt6, l.local_addr()?, Some(*p)),
        };
        let mut sn = Sockname::new(protocol, addr.ip().to_string(), addr.port());
        if let Some(p) = params {
            sn.mss = Some(p.mss);
            sn.max_bw = Some(p.max_bw);
        }
        Ok(sn)
    }
}

/// Apply the send/recv buffer size overrides that both server and client
/// construction share (spec.md §4.2).
pub fn apply_buffer_sizes(socket: &Socket, send: Option<usize>, recv: Option<usize>) -> io::Result<()> {
    if let Some(n) = send {
        socket.set_send_buffer_size(n)?;
    }
    if let Some(n) = recv {
        socket.set_recv_buffer_size(n)?;
    }
    Ok(())
}

pub fn domain_for(protocol: Protocol) -> Domain {
    if protocol.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    }
}

pub fn new_tcp_socket(protocol: Protocol) -> io::Result<Socket> {
    Socket::new(domain_for(protocol), Type::STREAM, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_zero_yields_requested_size_then_eof() {
        let mut ch = Channel::DevZero(10);
        let mut buf = [0xffu8; 16];
        let n = ch.read(&mut buf).await.unwrap();
        assert_eq!(n, 10);
        assert!(buf[..10].iter().all(|&b| b == 0));
        let n2 = ch.read(&mut buf).await.unwrap();
        assert_eq!(n2, 0);
    }

    #[tokio::test]
    async fn dev_null_accepts_unlimited_writes() {
        let mut ch = Channel::DevNull;
        let n = ch.write(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(n, 4);
    }

    #[tokio::test]
    async fn unlimited_rate_limiter_never_sleeps() {
        let limiter = RateLimiter::new(-1);
        let start = Instant::now();
        limiter.throttle(10_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
