//! Data-connection dispatcher (spec.md §4.6): runs on a newly-accepted
//! data connection, reads the brace-delimited header, locates the
//! matching transfer, and runs the push or pull copy loop.

use std::sync::Arc;

use log::{debug, warn};

use crate::channel::Channel;
use crate::header::{self, DataHeader};
use crate::open_mode::OpenMode;
use crate::shared_state::{SharedState, WorkerGuard};
use crate::transfer::{self, TransferRecord, LOCK_RETRY_INTERVAL};

/// Implementation choice, not equal to the initiator's `bufSize`
/// (spec.md §4.6: "on the order of 10 MiB").
const DATA_BUF_SIZE: usize = 10 * 1024 * 1024;

const HEADER_LOOKAHEAD: usize = 4096;

/// Drive one accepted data connection to completion.
pub async fn run(state: Arc<SharedState>, mut channel: Channel) {
    let _guard = WorkerGuard::new(state.clone());

    let (header, leftover) = match read_header(&mut channel).await {
        Some(parsed) => parsed,
        None => {
            warn!("data connection closed without a parseable header");
            return;
        }
    };

    let record = match locate(&state, &header.uuid).await {
        Some(r) => r,
        None => {
            warn!("data connection named unknown uuid {}", header.uuid);
            return;
        }
    };

    if !mode_is_compatible(&header, record.open_mode) {
        warn!(
            "data connection for {} requested push={} against incompatible mode {}",
            header.uuid, header.push, record.open_mode
        );
        return;
    }

    debug!("data connection for {} serving {} bytes (push={})", header.uuid, header.sz, header.push);

    if header.push {
        serve_from_file(&record, channel, header.sz).await;
    } else {
        write_to_file(&record, channel, header.sz, leftover).await;
    }
}

async fn read_header(channel: &mut Channel) -> Option<(DataHeader, Vec<u8>)> {
    let mut buf = vec![0u8; HEADER_LOOKAHEAD];
    let mut filled = 0usize;
    loop {
        if filled == buf.len() {
            return None;
        }
        let n = match channel.read(&mut buf[filled..]).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };
        filled += n;
        if let Ok((header, after)) = header::parse_data_header(&buf[..filled]) {
            return Some((header, buf[after..filled].to_vec()));
        }
    }
}

fn mode_is_compatible(header: &DataHeader, mode: OpenMode) -> bool {
    if header.push {
        mode == OpenMode::Read
    } else {
        matches!(mode, OpenMode::OverWrite | OpenMode::New | OpenMode::Resume)
    }
}

/// Locate the transfer by the §5 locking protocol: map lock released
/// before the record is ever touched, same as [`transfer::find`]. A
/// short bounded retry covers the race where the data connection reaches
/// us slightly before the control connection finishes inserting the
/// record it names.
const LOCATE_RETRIES: u32 = 64;

async fn locate(state: &SharedState, uuid: &str) -> Option<Arc<TransferRecord>> {
    for attempt in 0..LOCATE_RETRIES {
        if let Some(record) = transfer::find(state, uuid) {
            return Some(record);
        }
        if attempt + 1 < LOCATE_RETRIES {
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }
    None
}

/// No `push` key: the peer is streaming bytes at us (spec.md §4.6, "pull
/// direction" from this wrapper's point of view — we pull bytes off the
/// wire and write them to the file).
async fn write_to_file(record: &Arc<TransferRecord>, channel: Channel, sz: u64, leftover: Vec<u8>) {
    let mut inner = record.lock().await;

    let mut written = 0u64;
    if !leftover.is_empty() {
        if inner.fd.write_all(&leftover).await.is_err() {
            return;
        }
        written = leftover.len() as u64;
    }

    inner.data_fd = Some(channel);
    let mut buf = vec![0u8; DATA_BUF_SIZE];
    while written < sz {
        if record.is_cancelled() {
            break;
        }
        let want = (sz - written).min(buf.len() as u64) as usize;
        let n = match inner.data_fd.as_mut() {
            Some(dc) => match dc.read(&mut buf[..want]).await {
                Ok(n) => n,
                Err(_) => break,
            },
            None => break,
        };
        if n == 0 {
            break;
        }
        if inner.fd.write_all(&buf[..n]).await.is_err() {
            break;
        }
        written += n as u64;
    }

    if written >= sz {
        if let Some(dc) = inner.data_fd.as_mut() {
            let _ = dc.write_all(b"y").await;
        }
    }
    inner.data_fd = None;
}

/// `push:1`: the peer asked us to serve bytes from our own file (spec.md
/// §4.6, "push direction" — we read the file and push it down the wire).
async fn serve_from_file(record: &Arc<TransferRecord>, channel: Channel, sz: u64) {
    let mut inner = record.lock().await;

    inner.data_fd = Some(channel);
    let mut buf = vec![0u8; DATA_BUF_SIZE];
    let mut sent = 0u64;
    while sent < sz {
        if record.is_cancelled() {
            break;
        }
        let want = (sz - sent).min(buf.len() as u64) as usize;
        let n = match inner.fd.read(&mut buf[..want]).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        match inner.data_fd.as_mut() {
            Some(dc) => {
                if dc.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            None => break,
        }
        sent += n as u64;
    }

    if sent >= sz {
        if let Some(dc) = inner.data_fd.as_mut() {
            let mut ack = [0u8; 1];
            let _ = dc.read(&mut ack).await;
        }
    }
    inner.data_fd = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_factory::SocketSettings;

    #[test]
    fn push_requires_read_mode() {
        let header = DataHeader {
            uuid: "u".into(),
            sz: 1,
            push: true,
        };
        assert!(mode_is_compatible(&header, OpenMode::Read));
        assert!(!mode_is_compatible(&header, OpenMode::New));
    }

    #[test]
    fn non_push_requires_write_mode() {
        let header = DataHeader {
            uuid: "u".into(),
            sz: 1,
            push: false,
        };
        assert!(mode_is_compatible(&header, OpenMode::OverWrite));
        assert!(mode_is_compatible(&header, OpenMode::Resume));
        assert!(!mode_is_compatible(&header, OpenMode::Read));
    }

    #[tokio::test]
    async fn locate_returns_none_for_unknown_uuid() {
        let state = SharedState::new(vec![], 4096, SocketSettings::default());
        assert!(locate(&state, "missing").await.is_none());
    }
}
