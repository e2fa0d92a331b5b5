//! The in-process [`TransferServer`] implementation (spec.md §4.3): owns
//! exactly one fixed session UUID, generated once at construction, which
//! doubles as the key of the single transfer this session may have
//! registered at a time. Whether a transfer is "active" is never tracked
//! by a separate flag — it is exactly "does `transfers` contain an entry
//! under my UUID right now", so the two can never drift apart.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::endpoint_factory::{self, SocketSettings};
use crate::error::{EtdError, EtdResult};
use crate::header;
use crate::open_mode::OpenMode;
use crate::path::normalize;
use crate::shared_state::SharedState;
use crate::size_literal;
use crate::sockname::{negotiate_max_bw, negotiate_mss, EndpointUrl, Protocol, Sockname};
use crate::transfer::{self, TransferRecord};
use crate::transfer_api::{self, TransferResult, TransferServer};

pub struct LocalTransferServer {
    state: Arc<SharedState>,
    uuid: String,
}

impl LocalTransferServer {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self::for_session(state, Uuid::new_v4().to_string())
    }

    /// Build a view over an already-running session's transfer, keyed by
    /// its existing UUID. [`LocalTransferServer`] carries no state of its
    /// own beyond that UUID — every operation reads and writes through
    /// `state.transfers()` — so recreating one to act on the same
    /// session from a different task (e.g. a detached `sendFile` worker,
    /// or a `cancel` dispatched while that worker runs) is exactly
    /// equivalent to reusing the original instance (spec.md §4.5).
    pub fn for_session(state: Arc<SharedState>, uuid: String) -> Self {
        Self { state, uuid }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    fn reject_if_own_uuid_is_busy(&self) -> EtdResult<()> {
        if transfer::find(&self.state, &self.uuid).is_some() {
            return Err(EtdError::TransferConflict(
                "this control session already has an active transfer".into(),
            ));
        }
        Ok(())
    }

    /// Any existing record anywhere on the daemon with this path is a
    /// conflict, except the `/dev/null` exemption (spec.md §4.3).
    fn reject_if_path_in_use(&self, normalized: &str) -> EtdResult<()> {
        if size_literal::is_dev_null(normalized) {
            return Ok(());
        }
        let transfers = self.state.transfers().lock();
        if transfers.values().any(|r| r.path == normalized) {
            debug!("{normalized} rejected: already has an active transfer");
            return Err(EtdError::TransferConflict(format!(
                "{normalized} already has an active transfer"
            )));
        }
        Ok(())
    }

    async fn connect_data_channel(
        &self,
        addrs: &[Sockname],
        default_port: u16,
        cancel_probe: impl Fn() -> bool + Sync,
    ) -> EtdResult<Channel> {
        let mut last_err = None;
        for addr in addrs {
            let url = EndpointUrl {
                protocol: addr.protocol,
                host: addr.host.clone(),
                port: Some(addr.port),
            };
            let mut settings = self.state.socket_settings.clone();
            settings.send_buffer = Some(self.state.buf_size);
            settings.recv_buffer = Some(self.state.buf_size);
            settings.udt_mss = Some(negotiate_mss(settings.udt_mss, addr.mss, 1500));
            settings.udt_max_bw = Some(negotiate_max_bw(settings.udt_max_bw, addr.max_bw));

            match endpoint_factory::mk_client(&url, &settings, default_port, &cancel_probe).await {
                Ok(channel) => return Ok(channel),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| EtdError::Resolution("no endpoints to try".into())))
    }
}

#[async_trait]
impl TransferServer for LocalTransferServer {
    async fn list_path(&self, path: &str, allow_tilde: bool) -> EtdResult<Vec<String>> {
        if size_literal::is_dev_zero(path) {
            return Ok(vec![path.to_string()]);
        }

        let expanded = if path.contains('~') {
            if !allow_tilde {
                return Err(EtdError::Protocol(
                    "tilde expansion requested but not permitted".into(),
                ));
            }
            expand_tilde(path)?
        } else {
            path.to_string()
        };

        let pattern = if expanded.ends_with('/') {
            format!("{expanded}*")
        } else {
            expanded
        };

        let entries = glob::glob(&pattern)
            .map_err(|e| EtdError::Protocol(format!("invalid glob pattern: {e}")))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EtdError::Io(e.into_error()))?;
            let mut rendered = entry.to_string_lossy().into_owned();
            if entry.is_dir() {
                rendered.push('/');
            }
            out.push(rendered);
        }
        Ok(out)
    }

    async fn request_file_write(&self, path: &str, mode: OpenMode) -> EtdResult<(String, u64)> {
        self.reject_if_own_uuid_is_busy()?;
        if !mode.is_write_request_mode() {
            return Err(EtdError::Protocol(format!(
                "{mode} is not a valid requestFileWrite mode"
            )));
        }
        let normalized = normalize(path);
        self.reject_if_path_in_use(&normalized)?;

        if size_literal::is_dev_null(&normalized) {
            let record = TransferRecord::new(normalized, mode, Channel::DevNull);
            self.state
                .transfers()
                .lock()
                .insert(self.uuid.clone(), record);
            return Ok((self.uuid.clone(), 0));
        }

        if let Some(parent) = std::path::Path::new(&normalized).parent() {
            if !parent.as_os_str().is_empty() {
                let mut builder = tokio::fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                builder.mode(0o755);
                builder.create(parent).await?;
            }
        }

        let mut opts = mode.to_open_options();
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }

        let mut fd = match mode {
            OpenMode::New => match opts.open(&normalized).await {
                Ok(f) => Channel::File(f),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(EtdError::FileExists)
                }
                Err(e) => return Err(EtdError::Io(e)),
            },
            // Resolved at request time rather than mapped to an O/S flag
            // combination: if the file is already there, open it
            // read-only and report its full size as `alreadyHave` so the
            // caller sees it as already-complete instead of failing.
            OpenMode::SkipExisting => match opts.open(&normalized).await {
                Ok(f) => Channel::File(f),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let existing = tokio::fs::OpenOptions::new()
                        .read(true)
                        .open(&normalized)
                        .await?;
                    let mut existing = Channel::File(existing);
                    let size = existing.lseek(io::SeekFrom::End(0)).await?;
                    let record = TransferRecord::new(normalized, mode, existing);
                    self.state
                        .transfers()
                        .lock()
                        .insert(self.uuid.clone(), record);
                    return Ok((self.uuid.clone(), size));
                }
                Err(e) => return Err(EtdError::Io(e)),
            },
            _ => Channel::File(opts.open(&normalized).await?),
        };

        let already_have = fd.lseek(io::SeekFrom::End(0)).await?;
        let record = TransferRecord::new(normalized, mode, fd);
        self.state
            .transfers()
            .lock()
            .insert(self.uuid.clone(), record);
        Ok((self.uuid.clone(), already_have))
    }

    async fn request_file_read(&self, path: &str, already_have: u64) -> EtdResult<(String, u64)> {
        self.reject_if_own_uuid_is_busy()?;
        let normalized = normalize(path);

        {
            let transfers = self.state.transfers().lock();
            if let Some(existing) = transfers.values().find(|r| r.path == normalized) {
                if existing.open_mode != OpenMode::Read {
                    return Err(EtdError::TransferConflict(format!(
                        "{normalized} is open for writing, not readable concurrently"
                    )));
                }
            }
        }

        let mut fd = if size_literal::is_dev_zero(&normalized) {
            Channel::DevZero(size_literal::dev_zero_size(&normalized)?)
        } else {
            Channel::File(
                tokio::fs::OpenOptions::new()
                    .read(true)
                    .open(&normalized)
                    .await?,
            )
        };

        let size = fd.lseek(io::SeekFrom::End(0)).await?;
        fd.lseek(io::SeekFrom::Start(already_have)).await?;
        let remaining = size.saturating_sub(already_have);

        let record = TransferRecord::new(normalized, OpenMode::Read, fd);
        self.state
            .transfers()
            .lock()
            .insert(self.uuid.clone(), record);
        Ok((self.uuid.clone(), remaining))
    }

    async fn data_channel_addr(&self) -> EtdResult<Vec<Sockname>> {
        Ok(self.state.dataaddrs().to_vec())
    }

    async fn send_file(
        &self,
        src_uuid: &str,
        dst_uuid: &str,
        todo: u64,
        dst_addrs: &[Sockname],
    ) -> EtdResult<TransferResult> {
        if src_uuid != self.uuid {
            return Err(EtdError::TransferConflict(
                "srcUUID does not match this session".into(),
            ));
        }
        let record = transfer::find(&self.state, src_uuid).ok_or_else(|| {
            EtdError::TransferConflict(format!("no transfer registered under {src_uuid}"))
        })?;

        let start = Instant::now();
        let mut inner = record.lock().await;

        let probe = || record.is_cancelled() || self.state.is_cancelled();
        let mut data_channel = self
            .connect_data_channel(dst_addrs, Protocol::default_data_port(), probe)
            .await?;

        let chunk_size = data_channel
            .preferred_chunk_size(self.state.buf_size)
            .max(1);
        let header = header::render_header(dst_uuid, todo, false);
        data_channel.write_all(header.as_bytes()).await?;
        inner.data_fd = Some(data_channel);

        let mut buf = vec![0u8; chunk_size];
        let mut transferred = 0u64;
        let mut cancelled = false;
        while transferred < todo {
            if record.is_cancelled() || self.state.is_cancelled() {
                cancelled = true;
                break;
            }
            let want = (todo - transferred).min(buf.len() as u64) as usize;
            let n = inner.fd.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            match inner.data_fd.as_mut() {
                Some(dc) => dc.write_all(&buf[..n]).await?,
                None => {
                    cancelled = true;
                    break;
                }
            }
            transferred += n as u64;
        }

        if !cancelled && transferred >= todo {
            match inner.data_fd.as_mut() {
                Some(dc) => {
                    let mut ack = [0u8; 1];
                    dc.read(&mut ack).await?;
                }
                None => cancelled = true,
            }
        }
        inner.data_fd = None;

        if cancelled {
            warn!("sendFile {src_uuid}->{dst_uuid} cancelled after {transferred} of {todo} bytes");
        } else {
            debug!("sendFile {src_uuid}->{dst_uuid} moved {transferred} bytes in {:?}", start.elapsed());
        }

        Ok(if cancelled {
            TransferResult::cancelled(transferred)
        } else if transferred < todo {
            TransferResult::failed(transferred, "short read from source file", start.elapsed())
        } else {
            TransferResult::success(transferred, start.elapsed())
        })
    }

    async fn get_file(
        &self,
        src_uuid: &str,
        dst_uuid: &str,
        todo: u64,
        src_addrs: &[Sockname],
    ) -> EtdResult<TransferResult> {
        if dst_uuid != self.uuid {
            return Err(EtdError::TransferConflict(
                "dstUUID does not match this session".into(),
            ));
        }
        let record = transfer::find(&self.state, dst_uuid).ok_or_else(|| {
            EtdError::TransferConflict(format!("no transfer registered under {dst_uuid}"))
        })?;
        if !record.open_mode.is_pull_destination_mode() {
            return Err(EtdError::Protocol(format!(
                "{} is not a valid getFile destination mode",
                record.open_mode
            )));
        }

        let start = Instant::now();
        let mut inner = record.lock().await;

        let probe = || record.is_cancelled() || self.state.is_cancelled();
        let mut data_channel = self
            .connect_data_channel(src_addrs, Protocol::default_data_port(), probe)
            .await?;

        let chunk_size = data_channel
            .preferred_chunk_size(self.state.buf_size)
            .max(1);
        let header = header::render_header(src_uuid, todo, true);
        data_channel.write_all(header.as_bytes()).await?;
        inner.data_fd = Some(data_channel);

        let mut buf = vec![0u8; chunk_size];
        let mut transferred = 0u64;
        let mut cancelled = false;
        while transferred < todo {
            if record.is_cancelled() || self.state.is_cancelled() {
                cancelled = true;
                break;
            }
            let want = (todo - transferred).min(buf.len() as u64) as usize;
            let n = match inner.data_fd.as_mut() {
                Some(dc) => dc.read(&mut buf[..want]).await?,
                None => {
                    cancelled = true;
                    break;
                }
            };
            if n == 0 {
                break;
            }
            inner.fd.write_all(&buf[..n]).await?;
            transferred += n as u64;
        }

        if !cancelled && transferred >= todo {
            match inner.data_fd.as_mut() {
                Some(dc) => dc.write_all(b"y").await?,
                None => cancelled = true,
            }
        }
        inner.data_fd = None;

        Ok(if cancelled {
            TransferResult::cancelled(transferred)
        } else if transferred < todo {
            TransferResult::failed(transferred, "short read from data channel", start.elapsed())
        } else {
            TransferResult::success(transferred, start.elapsed())
        })
    }

    async fn remove_uuid(&self, uuid: &str) -> EtdResult<bool> {
        if uuid != self.uuid {
            return Err(EtdError::TransferConflict(
                "uuid does not match this session".into(),
            ));
        }
        Ok(transfer::remove_uuid(&self.state, uuid).await)
    }

    async fn cancel(&self, uuid: &str) -> EtdResult<()> {
        if uuid != self.uuid {
            return Err(EtdError::TransferConflict(
                "uuid does not match this session".into(),
            ));
        }
        if let Some(record) = transfer::find(&self.state, uuid) {
            record.cancel();
        }
        Ok(())
    }

    async fn protocol_version(&self) -> EtdResult<u32> {
        Ok(transfer_api::PROTOCOL_VERSION)
    }
}

fn expand_tilde(path: &str) -> EtdResult<String> {
    let home = || {
        directories::BaseDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .ok_or_else(|| EtdError::Resolution("cannot determine home directory".into()))
    };
    if let Some(rest) = path.strip_prefix("~/") {
        Ok(home()?.join(rest).to_string_lossy().into_owned())
    } else if path == "~" {
        Ok(home()?.to_string_lossy().into_owned())
    } else {
        Err(EtdError::Protocol(format!(
            "unsupported tilde expansion in {path}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<SharedState> {
        SharedState::new(vec![], 4096, SocketSettings::default())
    }

    #[tokio::test]
    async fn list_path_recognizes_dev_zero_without_touching_disk() {
        let server = LocalTransferServer::new(state());
        let out = server.list_path("/dev/zero:16MiB", false).await.unwrap();
        assert_eq!(out, vec!["/dev/zero:16MiB".to_string()]);
    }

    #[tokio::test]
    async fn write_request_reports_already_have_zero_for_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let server = LocalTransferServer::new(state());
        let (uuid, already_have) = server
            .request_file_write(path.to_str().unwrap(), OpenMode::New)
            .await
            .unwrap();
        assert_eq!(uuid, server.uuid());
        assert_eq!(already_have, 0);
    }

    #[tokio::test]
    async fn new_mode_reports_file_exists_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        tokio::fs::write(&path, b"hi").await.unwrap();

        let server = LocalTransferServer::new(state());
        let err = server
            .request_file_write(path.to_str().unwrap(), OpenMode::New)
            .await
            .unwrap_err();
        assert!(err.is_file_exists());
    }

    #[tokio::test]
    async fn second_session_cannot_claim_a_path_already_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let shared = state();

        let first = LocalTransferServer::new(shared.clone());
        first
            .request_file_write(path.to_str().unwrap(), OpenMode::New)
            .await
            .unwrap();

        let second = LocalTransferServer::new(shared);
        let err = second
            .request_file_write(path.to_str().unwrap(), OpenMode::New)
            .await
            .unwrap_err();
        assert!(matches!(err, EtdError::TransferConflict(_)));
    }

    #[tokio::test]
    async fn remove_uuid_is_idempotent_and_ownership_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let shared = state();
        let server = LocalTransferServer::new(shared.clone());
        let (uuid, _) = server
            .request_file_write(path.to_str().unwrap(), OpenMode::New)
            .await
            .unwrap();

        let other = LocalTransferServer::new(shared);
        assert!(other.remove_uuid(&uuid).await.is_err());

        assert!(server.remove_uuid(&uuid).await.unwrap());
        assert!(!server.remove_uuid(&uuid).await.unwrap());
    }

    #[tokio::test]
    async fn skip_existing_reuses_existing_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let server = LocalTransferServer::new(state());
        let (_uuid, already_have) = server
            .request_file_write(path.to_str().unwrap(), OpenMode::SkipExisting)
            .await
            .unwrap();
        assert_eq!(already_have, 5);
    }
}
