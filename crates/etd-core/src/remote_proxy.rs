//! Wire-serializing [`TransferServer`] implementation (spec.md §4.4): the
//! same API as [`crate::local_server::LocalTransferServer`], but every
//! call becomes one line written to a control [`Channel`] and one or more
//! lines read back.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;

use crate::channel::Channel;
use crate::error::{looks_like_file_exists, EtdError, EtdResult};
use crate::open_mode::OpenMode;
use crate::sockname::Sockname;
use crate::transfer_api::{self, TransferResult, TransferServer};

/// The control connection plus the small amount of state a proxy needs
/// to carry between calls: a line-reassembly buffer, and the peer's
/// protocol version once queried (spec.md §4.4: "caches the result after
/// the first query").
struct ProxyConn {
    channel: Channel,
    read_buf: Vec<u8>,
    cached_version: u32,
}

pub struct RemoteTransferProxy {
    conn: AsyncMutex<ProxyConn>,
}

impl RemoteTransferProxy {
    pub fn new(control: Channel) -> Self {
        Self {
            conn: AsyncMutex::new(ProxyConn {
                channel: control,
                read_buf: Vec::new(),
                cached_version: transfer_api::PROTOCOL_VERSION_UNKNOWN,
            }),
        }
    }
}

async fn write_line(conn: &mut ProxyConn, line: &str) -> EtdResult<()> {
    let mut msg = String::with_capacity(line.len() + 1);
    msg.push_str(line);
    msg.push('\n');
    conn.channel.write_all(msg.as_bytes()).await?;
    Ok(())
}

async fn read_line(conn: &mut ProxyConn) -> EtdResult<String> {
    loop {
        if let Some(pos) = conn.read_buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = conn.read_buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            return Ok(text.trim_end_matches(['\r', '\n']).to_string());
        }
        let mut chunk = [0u8; 4096];
        let n = conn.channel.read(&mut chunk).await?;
        if n == 0 {
            return Err(EtdError::Protocol(
                "control connection closed mid-reply".into(),
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..n]);
    }
}

/// Fetch the peer's protocol version, querying at most once per
/// connection (spec.md §4.4).
async fn fetch_protocol_version(conn: &mut ProxyConn) -> EtdResult<u32> {
    if conn.cached_version != transfer_api::PROTOCOL_VERSION_UNKNOWN {
        return Ok(conn.cached_version);
    }
    write_line(conn, "protocol-version").await?;
    let line = read_line(conn).await?;
    let version = line
        .strip_prefix("OK ")
        .and_then(|s| s.trim().parse::<u32>().ok())
        .ok_or_else(|| EtdError::Protocol(format!("malformed protocol-version reply: {line}")))?;
    conn.cached_version = version;
    Ok(version)
}

/// An `ERR <reason>` reply line, reason already stripped of the leading
/// keyword. `File exists` is recognized and re-surfaced as the
/// distinguished error kind (spec.md §4.4).
fn parse_err_reply(rest: &str) -> EtdError {
    let reason = rest.trim_start();
    if looks_like_file_exists(reason) {
        EtdError::FileExists
    } else {
        EtdError::TransferConflict(reason.to_string())
    }
}

static RESULT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(OK|ERR)(?:,(\d+),([0-9.]+))?(?: (.*))?$").unwrap());

/// `OK[,<bytes>,<seconds>][ <reason>]` / `ERR[,<bytes>,<seconds>][ <reason>]`
/// — the single-line reply to `send-file`/`get-file` (spec.md §4.4).
fn parse_transfer_result_line(line: &str) -> EtdResult<TransferResult> {
    let caps = RESULT_LINE
        .captures(line.trim())
        .ok_or_else(|| EtdError::Protocol(format!("malformed transfer-result reply: {line}")))?;
    let finished = &caps[1] == "OK";
    let bytes_transferred = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let seconds = caps
        .get(3)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0);
    let reason = caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default();
    Ok(TransferResult {
        finished,
        bytes_transferred,
        reason,
        duration: Duration::from_secs_f64(seconds),
    })
}

#[async_trait]
impl TransferServer for RemoteTransferProxy {
    /// The wire form (spec.md §4.4) carries no `allowTilde` flag; tilde
    /// handling is opaque to this proxy and governed entirely by the
    /// peer's own configuration.
    async fn list_path(&self, path: &str, _allow_tilde: bool) -> EtdResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        write_line(&mut conn, &format!("list {path}")).await?;
        let mut out = Vec::new();
        loop {
            let line = read_line(&mut conn).await?;
            if line == "OK" {
                return Ok(out);
            } else if let Some(rest) = line.strip_prefix("OK ") {
                out.push(rest.to_string());
            } else if let Some(reason) = line.strip_prefix("ERR") {
                return Err(parse_err_reply(reason));
            } else {
                return Err(EtdError::Protocol(format!("unexpected list reply: {line}")));
            }
        }
    }

    async fn request_file_write(&self, path: &str, mode: OpenMode) -> EtdResult<(String, u64)> {
        let mut conn = self.conn.lock().await;
        write_line(&mut conn, &format!("write-file-{mode} {path}")).await?;

        let first = read_line(&mut conn).await?;
        if let Some(reason) = first.strip_prefix("ERR") {
            return Err(parse_err_reply(reason));
        }
        let already_have: u64 = first
            .strip_prefix("AlreadyHave:")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EtdError::Protocol(format!("malformed write-file reply: {first}")))?;

        let uuid_line = read_line(&mut conn).await?;
        let uuid = uuid_line
            .strip_prefix("UUID:")
            .ok_or_else(|| EtdError::Protocol(format!("malformed write-file reply: {uuid_line}")))?
            .to_string();

        let ok_line = read_line(&mut conn).await?;
        if ok_line != "OK" {
            return Err(EtdError::Protocol(format!(
                "expected terminal OK, got: {ok_line}"
            )));
        }
        Ok((uuid, already_have))
    }

    async fn request_file_read(&self, path: &str, already_have: u64) -> EtdResult<(String, u64)> {
        let mut conn = self.conn.lock().await;
        write_line(&mut conn, &format!("read-file {already_have} {path}")).await?;

        let first = read_line(&mut conn).await?;
        if let Some(reason) = first.strip_prefix("ERR") {
            return Err(parse_err_reply(reason));
        }
        let remaining: u64 = first
            .strip_prefix("Remain:")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EtdError::Protocol(format!("malformed read-file reply: {first}")))?;

        let uuid_line = read_line(&mut conn).await?;
        let uuid = uuid_line
            .strip_prefix("UUID:")
            .ok_or_else(|| EtdError::Protocol(format!("malformed read-file reply: {uuid_line}")))?
            .to_string();

        let ok_line = read_line(&mut conn).await?;
        if ok_line != "OK" {
            return Err(EtdError::Protocol(format!(
                "expected terminal OK, got: {ok_line}"
            )));
        }
        Ok((uuid, remaining))
    }

    async fn data_channel_addr(&self) -> EtdResult<Vec<Sockname>> {
        let mut conn = self.conn.lock().await;
        let version = fetch_protocol_version(&mut conn).await?;
        let cmd = if version >= 1 {
            "data-channel-addr-ext"
        } else {
            "data-channel-addr"
        };
        write_line(&mut conn, cmd).await?;

        let mut out = Vec::new();
        loop {
            let line = read_line(&mut conn).await?;
            if line == "OK" {
                return Ok(out);
            } else if let Some(rest) = line.strip_prefix("OK ") {
                out.push(Sockname::parse(rest.trim())?);
            } else if let Some(reason) = line.strip_prefix("ERR") {
                return Err(parse_err_reply(reason));
            } else {
                return Err(EtdError::Protocol(format!(
                    "unexpected data-channel-addr reply: {line}"
                )));
            }
        }
    }

    async fn send_file(
        &self,
        src_uuid: &str,
        dst_uuid: &str,
        todo: u64,
        dst_addrs: &[Sockname],
    ) -> EtdResult<TransferResult> {
        let mut conn = self.conn.lock().await;
        let version = fetch_protocol_version(&mut conn).await?;
        let addrs = dst_addrs
            .iter()
            .map(|a| a.encode_for_version(version))
            .collect::<Vec<_>>()
            .join(",");
        write_line(
            &mut conn,
            &format!("send-file {src_uuid} {dst_uuid} {todo} {addrs}"),
        )
        .await?;
        let line = read_line(&mut conn).await?;
        parse_transfer_result_line(&line)
    }

    /// There is no separate `get-file` wire command (spec.md §4.4 lists
    /// only one row for this choreography): the peer decides whether to
    /// push or pull by checking which of `srcUUID`/`dstUUID` matches its
    /// own session UUID, so `getFile` reuses `send-file` verbatim.
    async fn get_file(
        &self,
        src_uuid: &str,
        dst_uuid: &str,
        todo: u64,
        src_addrs: &[Sockname],
    ) -> EtdResult<TransferResult> {
        let mut conn = self.conn.lock().await;
        let version = fetch_protocol_version(&mut conn).await?;
        let addrs = src_addrs
            .iter()
            .map(|a| a.encode_for_version(version))
            .collect::<Vec<_>>()
            .join(",");
        write_line(
            &mut conn,
            &format!("send-file {src_uuid} {dst_uuid} {todo} {addrs}"),
        )
        .await?;
        let line = read_line(&mut conn).await?;
        parse_transfer_result_line(&line)
    }

    /// The wire reply only distinguishes success from failure, not
    /// "removed" from "already gone" — that finer idempotent distinction
    /// is only observable in-process. An `OK` here is reported as `true`.
    async fn remove_uuid(&self, uuid: &str) -> EtdResult<bool> {
        let mut conn = self.conn.lock().await;
        write_line(&mut conn, &format!("remove-uuid {uuid}")).await?;
        let line = read_line(&mut conn).await?;
        if line == "OK" {
            Ok(true)
        } else if let Some(reason) = line.strip_prefix("ERR") {
            Err(parse_err_reply(reason))
        } else {
            Err(EtdError::Protocol(format!(
                "unexpected remove-uuid reply: {line}"
            )))
        }
    }

    /// `cancel` has no reply on the wire (spec.md §4.4).
    async fn cancel(&self, uuid: &str) -> EtdResult<()> {
        let mut conn = self.conn.lock().await;
        write_line(&mut conn, &format!("cancel {uuid}")).await
    }

    async fn protocol_version(&self) -> EtdResult<u32> {
        let mut conn = self.conn.lock().await;
        fetch_protocol_version(&mut conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_result_line() {
        let result = parse_transfer_result_line("OK,1048576,0.42").unwrap();
        assert!(result.finished);
        assert_eq!(result.bytes_transferred, 1_048_576);
        assert!((result.duration.as_secs_f64() - 0.42).abs() < 1e-9);
    }

    #[test]
    fn parses_cancelled_result_line() {
        let result = parse_transfer_result_line("ERR,524288,0.1 Cancelled").unwrap();
        assert!(!result.finished);
        assert_eq!(result.bytes_transferred, 524_288);
        assert_eq!(result.reason, "Cancelled");
    }

    #[test]
    fn err_reply_recognizes_file_exists() {
        let err = parse_err_reply(" File exists");
        assert!(err.is_file_exists());
    }
}
