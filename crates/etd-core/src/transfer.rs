//! The per-UUID transfer record (spec.md §3/§4.3) and the lock-ordering
//! discipline (spec.md §5) used by `sendFile`, `getFile`, `removeUUID`,
//! and the data-channel wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::channel::Channel;
use crate::open_mode::OpenMode;
use crate::shared_state::SharedState;

/// `fd` and `data_fd` are only ever touched while `inner` is locked — that
/// lock *is* the `xfer_lock` of spec.md §3.
pub struct TransferInner {
    pub fd: Channel,
    pub data_fd: Option<Channel>,
}

/// One record per prepared file I/O (spec.md §3).
pub struct TransferRecord {
    pub path: String,
    pub open_mode: OpenMode,
    cancelled: AtomicBool,
    inner: AsyncMutex<TransferInner>,
}

impl TransferRecord {
    pub fn new(path: String, open_mode: OpenMode, fd: Channel) -> Arc<Self> {
        Arc::new(Self {
            path,
            open_mode,
            cancelled: AtomicBool::new(false),
            inner: AsyncMutex::new(TransferInner { fd, data_fd: None }),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Hold the `xfer_lock` for the duration of the closure — this is
    /// what `sendFile`/`getFile`/the data-channel wrapper do while
    /// copying (spec.md §4.3/§4.6).
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, TransferInner> {
        self.inner.lock().await
    }

    pub fn try_lock(&self) -> Option<tokio::sync::MutexGuard<'_, TransferInner>> {
        self.inner.try_lock().ok()
    }

    /// `cancel(uuid)` (spec.md §4.3): never blocks on the transfer lock.
    /// Set the flag, and if the data channel is reachable without
    /// blocking, close it in the background so a stuck copy loop observes
    /// the closure immediately instead of waiting for its next flag
    /// check.
    pub fn cancel(self: &Arc<Self>) {
        self.mark_cancelled();
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(mut data_fd) = inner.data_fd.take() {
                tokio::spawn(async move {
                    data_fd.close().await;
                });
            }
        }
    }
}

/// The interval the deadlock-avoidance retry loop sleeps for between
/// `try_lock` attempts (spec.md §5: "tens of microseconds").
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_micros(42);

/// Look a transfer up by UUID. The shared-state map lock is released
/// before the caller ever touches the record itself, which is what makes
/// it safe for the caller to then `.lock().await` the record's
/// `xfer_lock` directly (spec.md §5: map lock is always acquired *before*
/// `xfer_lock`, but the two are never held across a single blocking
/// operation together — see `remove_uuid` for the one case that needs the
/// `try_lock`-and-retry dance instead).
pub fn find(state: &SharedState, uuid: &str) -> Option<Arc<TransferRecord>> {
    state.transfers().lock().get(uuid).cloned()
}

/// `removeUUID` (spec.md §4.3): close the record's file FD (and data FD
/// if a copy loop is active, which unblocks it) before `try_lock`ing its
/// `xfer_lock`. On failure, release the map lock, sleep briefly, and
/// retry from the top — re-reading the map, since the record may have
/// been removed by a concurrent caller in the meantime. Returns `true`
/// if this call actually removed the record, `false` if the UUID was
/// already gone (spec.md §8, invariant 5: idempotent).
pub async fn remove_uuid(state: &SharedState, uuid: &str) -> bool {
    loop {
        let record = match find(state, uuid) {
            Some(r) => r,
            None => return false,
        };
        // Mark cancelled and close the data FD if it's reachable without
        // blocking. A copy loop mid-transfer holds `xfer_lock` for the
        // whole transfer, so this can't take the lock itself — but it
        // forces the loop to observe `cancelled` (or the closed data FD)
        // on its next iteration and return, which is what lets the
        // `try_lock` below eventually succeed instead of spinning forever
        // against an active transfer (spec.md §8, invariant 3).
        record.cancel();
        match record.try_lock() {
            Some(_guard) => {
                // Hold both locks just long enough to erase the entry;
                // dropping the removed record (and its guard) closes fd
                // and data_fd.
                let mut map = state.transfers().lock();
                map.remove(uuid);
                return true;
            }
            None => {
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
        }
    }
}
