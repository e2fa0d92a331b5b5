//! Error kinds the core distinguishes, per the control-protocol contract:
//! callers need to tell a transient conflict from a hard I/O failure from
//! a cancelled transfer, not just get a string back.

use std::io;

/// Everything a [`crate::local_server::LocalTransferServer`] or
/// [`crate::remote_proxy::RemoteTransferProxy`] call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum EtdError {
    /// Malformed command, unknown keyword, duplicate header key, oversize
    /// header with no closing brace. Always terminates the connection that
    /// produced it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The requested path is already in use by another transfer, or the
    /// UUID supplied does not belong to this session.
    #[error("transfer conflict: {0}")]
    TransferConflict(String),

    /// Distinguished sub-case of a failed `New` open: the file already
    /// exists. Carries the literal wire text `File exists` so a proxy can
    /// recognize it back from a control reply.
    #[error("File exists")]
    FileExists,

    /// Any underlying read/write/connect/accept/open failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transfer was aborted via `cancel()` or a terminating signal.
    #[error("cancelled")]
    Cancelled,

    /// Host could not be resolved, or the port was invalid.
    #[error("resolution error: {0}")]
    Resolution(String),
}

impl EtdError {
    /// The exact wire text the control wrapper emits for this error in an
    /// `ERR <reason>` reply. `FileExists` gets the special literal the
    /// proxy matches on; everything else is `Display`.
    pub fn wire_text(&self) -> String {
        match self {
            EtdError::FileExists => "File exists".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_file_exists(&self) -> bool {
        matches!(self, EtdError::FileExists)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EtdError::Cancelled)
    }
}

/// Recognize the `File exists` reply text coming back from a peer so the
/// proxy can re-surface it as [`EtdError::FileExists`] (spec.md §4.4).
pub fn looks_like_file_exists(reason: &str) -> bool {
    reason.contains("File exists")
}

pub type EtdResult<T> = std::result::Result<T, EtdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_exists_wire_text_is_exact() {
        assert_eq!(EtdError::FileExists.wire_text(), "File exists");
    }

    #[test]
    fn io_error_carries_strerror() {
        let err = EtdError::from(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        assert!(err.wire_text().contains("no such file"));
    }

    #[test]
    fn recognizes_file_exists_substring() {
        assert!(looks_like_file_exists("ERR File exists"));
        assert!(!looks_like_file_exists("ERR disk full"));
    }
}
