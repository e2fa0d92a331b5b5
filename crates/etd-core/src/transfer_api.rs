//! The transfer API (spec.md §4.3/§4.4): the operations both the
//! in-process [`crate::local_server::LocalTransferServer`] and the
//! wire-serializing [`crate::remote_proxy::RemoteTransferProxy`]
//! implement.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EtdResult;
use crate::open_mode::OpenMode;
use crate::sockname::Sockname;

/// `(finished, bytesTransferred, reason, duration)` (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub finished: bool,
    pub bytes_transferred: u64,
    pub reason: String,
    pub duration: Duration,
}

impl TransferResult {
    pub fn success(bytes_transferred: u64, duration: Duration) -> Self {
        Self {
            finished: true,
            bytes_transferred,
            reason: String::new(),
            duration,
        }
    }

    pub fn cancelled(bytes_transferred: u64) -> Self {
        Self {
            finished: false,
            bytes_transferred,
            reason: "Cancelled".to_string(),
            duration: Duration::ZERO,
        }
    }

    pub fn failed(bytes_transferred: u64, reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            finished: false,
            bytes_transferred,
            reason: reason.into(),
            duration,
        }
    }
}

/// The sendFile/getFile choreography of spec.md §2/§4.3, implemented
/// either in-process or over the wire.
#[async_trait]
pub trait TransferServer: Send + Sync {
    async fn list_path(&self, path: &str, allow_tilde: bool) -> EtdResult<Vec<String>>;

    async fn request_file_write(&self, path: &str, mode: OpenMode) -> EtdResult<(String, u64)>;

    async fn request_file_read(&self, path: &str, already_have: u64) -> EtdResult<(String, u64)>;

    async fn data_channel_addr(&self) -> EtdResult<Vec<Sockname>>;

    #[allow(clippy::too_many_arguments)]
    async fn send_file(
        &self,
        src_uuid: &str,
        dst_uuid: &str,
        todo: u64,
        dst_addrs: &[Sockname],
    ) -> EtdResult<TransferResult>;

    async fn get_file(
        &self,
        src_uuid: &str,
        dst_uuid: &str,
        todo: u64,
        src_addrs: &[Sockname],
    ) -> EtdResult<TransferResult>;

    async fn remove_uuid(&self, uuid: &str) -> EtdResult<bool>;

    async fn cancel(&self, uuid: &str) -> EtdResult<()>;

    async fn protocol_version(&self) -> EtdResult<u32>;
}

/// Current protocol version (spec.md §4.4).
pub const PROTOCOL_VERSION: u32 = 1;
/// Sentinel meaning "unknown/not yet queried" (spec.md §4.3).
pub const PROTOCOL_VERSION_UNKNOWN: u32 = u32::MAX;
