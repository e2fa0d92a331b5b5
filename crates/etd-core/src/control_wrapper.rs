//! Control-connection dispatcher (spec.md §4.5): owns one control
//! session (a fixed UUID backed by [`LocalTransferServer::for_session`]),
//! reads one line-oriented command at a time, and writes back the reply
//! shapes of spec.md §4.4's command table.
//!
//! The read and write halves of the connection are split so that a
//! `send-file` command can be handed to a detached worker without the
//! control channel going deaf: the read loop keeps accepting commands
//! (in particular `cancel`) while the worker streams bytes in the
//! background and eventually writes its own reply line.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::EtdError;
use crate::local_server::LocalTransferServer;
use crate::open_mode::OpenMode;
use crate::shared_state::{SharedState, WorkerGuard};
use crate::sockname::Sockname;
use crate::transfer_api::TransferServer;

const MIN_BUFFER: usize = 2 * 1024;

/// Drive one accepted control connection to completion. Returns when the
/// peer closes the connection or sends a command this wrapper cannot
/// parse (spec.md §4.5: "unknown commands terminate the connection").
/// Non-network channels (files, `/dev/zero`, `/dev/null`) are never
/// handed to this function; it only makes sense for an accepted TCP/UDT
/// connection.
pub async fn run(state: Arc<SharedState>, channel: Channel) {
    let stream = match channel.into_tcp_stream() {
        Ok(s) => s,
        Err(_) => return,
    };
    let _guard = WorkerGuard::new(state.clone());
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));
    let session_uuid = Uuid::new_v4().to_string();
    debug!("control session {session_uuid} started");

    let mut buf: Vec<u8> = Vec::with_capacity(MIN_BUFFER);
    let mut chunk = [0u8; MIN_BUFFER];

    loop {
        let line = match take_line(&mut buf) {
            Some(line) => line,
            None => match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    continue;
                }
            },
        };

        if !dispatch(&state, &session_uuid, &writer, &line).await {
            return;
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let split = buf.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let mut end = split;
    while end < buf.len() && (buf[end] == b'\r' || buf[end] == b'\n') {
        end += 1;
    }
    let text = String::from_utf8_lossy(&buf[..split]).into_owned();
    buf.drain(..end);
    if text.is_empty() {
        return take_line(buf);
    }
    Some(text)
}

async fn send_line(writer: &AsyncMutex<OwnedWriteHalf>, line: &str) -> bool {
    let mut msg = String::with_capacity(line.len() + 1);
    msg.push_str(line);
    msg.push('\n');
    let mut w = writer.lock().await;
    w.write_all(msg.as_bytes()).await.is_ok()
}

fn err_line(err: &EtdError) -> String {
    format!("ERR {}", err.wire_text())
}

/// Parse and run one command line. Returns `false` when the connection
/// should be closed (unknown command, or a write failure).
async fn dispatch(
    state: &Arc<SharedState>,
    session_uuid: &str,
    writer: &Arc<AsyncMutex<OwnedWriteHalf>>,
    line: &str,
) -> bool {
    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();
    let server = LocalTransferServer::for_session(state.clone(), session_uuid.to_string());

    match verb {
        "list" => match server.list_path(rest, true).await {
            Ok(entries) => {
                for entry in entries {
                    if !send_line(writer, &format!("OK {entry}")).await {
                        return false;
                    }
                }
                send_line(writer, "OK").await
            }
            Err(e) => send_line(writer, &err_line(&e)).await,
        },

        v if v.starts_with("write-file-") => {
            let mode_name = &v["write-file-".len()..];
            let mode = match OpenMode::parse(mode_name) {
                Some(m) => m,
                None => {
                    return send_line(writer, &format!("ERR unknown open mode '{mode_name}'")).await
                }
            };
            match server.request_file_write(rest, mode).await {
                Ok((uuid, already_have)) => {
                    send_line(writer, &format!("AlreadyHave:{already_have}")).await
                        && send_line(writer, &format!("UUID:{uuid}")).await
                        && send_line(writer, "OK").await
                }
                Err(e) => send_line(writer, &err_line(&e)).await,
            }
        }

        "read-file" => {
            let mut args = rest.splitn(2, ' ');
            let already_have: Option<u64> = args.next().and_then(|s| s.parse().ok());
            let path = args.next().unwrap_or("");
            let already_have = match already_have {
                Some(n) => n,
                None => return send_line(writer, "ERR malformed read-file arguments").await,
            };
            match server.request_file_read(path, already_have).await {
                Ok((uuid, remaining)) => {
                    send_line(writer, &format!("Remain:{remaining}")).await
                        && send_line(writer, &format!("UUID:{uuid}")).await
                        && send_line(writer, "OK").await
                }
                Err(e) => send_line(writer, &err_line(&e)).await,
            }
        }

        "data-channel-addr" | "data-channel-addr-ext" => {
            let version = if verb == "data-channel-addr-ext" { 1 } else { 0 };
            match server.data_channel_addr().await {
                Ok(addrs) => {
                    for addr in addrs {
                        if !send_line(writer, &format!("OK {}", addr.encode_for_version(version)))
                            .await
                        {
                            return false;
                        }
                    }
                    send_line(writer, "OK").await
                }
                Err(e) => send_line(writer, &err_line(&e)).await,
            }
        }

        "send-file" => {
            let mut args = rest.split(' ');
            let src_uuid = args.next().unwrap_or("").to_string();
            let dst_uuid = args.next().unwrap_or("").to_string();
            let todo: Option<u64> = args.next().and_then(|s| s.parse().ok());
            let addrs_field = args.next().unwrap_or("");
            let (todo, addrs) = match todo {
                Some(todo) => match parse_addrs(addrs_field) {
                    Ok(addrs) => (todo, addrs),
                    Err(e) => return send_line(writer, &err_line(&e)).await,
                },
                None => return send_line(writer, "ERR malformed send-file arguments").await,
            };

            // Detached so the control channel stays responsive — in
            // particular so a `cancel` for this same UUID can still be
            // read and acted on while the transfer is in flight
            // (spec.md §4.5).
            let state = state.clone();
            let session_uuid = session_uuid.to_string();
            let writer = writer.clone();
            tokio::spawn(async move {
                let reply =
                    run_send_or_get(&state, &session_uuid, src_uuid, dst_uuid, todo, addrs).await;
                send_line(&writer, &reply).await;
            });
            true
        }

        "remove-uuid" => match server.remove_uuid(rest).await {
            Ok(_) => send_line(writer, "OK").await,
            Err(e) => send_line(writer, &err_line(&e)).await,
        },

        "cancel" => {
            debug!("session {session_uuid} cancelling {rest}");
            let _ = server.cancel(rest).await;
            true
        }

        "protocol-version" => match server.protocol_version().await {
            Ok(v) => send_line(writer, &format!("OK {v}")).await,
            Err(e) => send_line(writer, &err_line(&e)).await,
        },

        _ => {
            warn!("session {session_uuid} sent unknown command '{verb}', closing connection");
            false
        }
    }
}

fn parse_addrs(field: &str) -> Result<Vec<Sockname>, EtdError> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field.split(',').map(Sockname::parse).collect()
}

/// Run `sendFile`/`getFile` against the session's transfer and render
/// the canonical `OK,<bytes>,<seconds>` / `ERR,<bytes>,<seconds> <reason>`
/// reply line (spec.md §4.5). Which direction runs is decided by
/// matching `srcUUID`/`dstUUID` against this session's own UUID — the
/// wire protocol has a single `send-file` command for both (spec.md
/// §4.4).
async fn run_send_or_get(
    state: &Arc<SharedState>,
    session_uuid: &str,
    src_uuid: String,
    dst_uuid: String,
    todo: u64,
    addrs: Vec<Sockname>,
) -> String {
    let server = LocalTransferServer::for_session(state.clone(), session_uuid.to_string());
    let start = Instant::now();

    let result = if src_uuid == session_uuid {
        server.send_file(&src_uuid, &dst_uuid, todo, &addrs).await
    } else {
        server.get_file(&src_uuid, &dst_uuid, todo, &addrs).await
    };

    match result {
        Ok(r) if r.finished => {
            debug!(
                "session {session_uuid} transfer finished: {} bytes in {:.3}s",
                r.bytes_transferred,
                r.duration.as_secs_f64()
            );
            format!("OK,{},{:.3}", r.bytes_transferred, r.duration.as_secs_f64())
        }
        Ok(r) => {
            warn!("session {session_uuid} transfer did not finish: {}", r.reason);
            format!(
                "ERR,{},{:.3} {}",
                r.bytes_transferred,
                r.duration.as_secs_f64(),
                r.reason
            )
        }
        Err(e) => {
            warn!("session {session_uuid} transfer failed: {e}");
            format!("ERR,0,{:.3} {}", start.elapsed().as_secs_f64(), e.wire_text())
        }
    }
}
