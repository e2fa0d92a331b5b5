//! Per-daemon mutable state (spec.md §3): the transfer map, the list of
//! data endpoints, cancellation hooks, and the default transport tuning
//! applied to every data channel the daemon initiates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Notify;

use crate::endpoint_factory::SocketSettings;
use crate::sockname::Sockname;
use crate::transfer::TransferRecord;

type CancelHook = Box<dyn Fn() + Send + Sync>;

/// Shared, per-daemon state (spec.md §3). Constructed once at process
/// start; every worker task holds an `Arc<SharedState>`.
pub struct SharedState {
    transfers: SyncMutex<HashMap<String, Arc<TransferRecord>>>,
    dataaddrs: Vec<Sockname>,
    cancellations: SyncMutex<HashMap<u64, CancelHook>>,
    next_hook_id: AtomicUsize,
    n_threads: AtomicUsize,
    idle: Notify,
    cancelled: AtomicBool,
    pub buf_size: usize,
    pub socket_settings: SocketSettings,
}

impl SharedState {
    pub fn new(dataaddrs: Vec<Sockname>, buf_size: usize, socket_settings: SocketSettings) -> Arc<Self> {
        Arc::new(Self {
            transfers: SyncMutex::new(HashMap::new()),
            dataaddrs,
            cancellations: SyncMutex::new(HashMap::new()),
            next_hook_id: AtomicUsize::new(0),
            n_threads: AtomicUsize::new(0),
            idle: Notify::new(),
            cancelled: AtomicBool::new(false),
            buf_size,
            socket_settings,
        })
    }

    pub fn dataaddrs(&self) -> &[Sockname] {
        &self.dataaddrs
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Flip the global cancel flag and fire every registered hook
    /// (spec.md §5: invoked by the signal-driven cancellation path).
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let hooks: Vec<CancelHook> = {
            let mut map = self.cancellations.lock();
            map.drain().map(|(_, hook)| hook).collect()
        };
        for hook in hooks {
            hook();
        }
    }

    /// Register a worker's cancellation hook; returns a token used to
    /// deregister it on clean exit. Only deregister when *not* being
    /// cancelled — `cancel_all` already drained the map, and iterating it
    /// again from the exiting worker would just be a harmless no-op, but
    /// skipping it avoids a lock round-trip on the hot path (spec.md §5).
    pub fn register_cancel_hook(&self, hook: CancelHook) -> u64 {
        let id = self.next_hook_id.fetch_add(1, Ordering::Relaxed) as u64;
        self.cancellations.lock().insert(id, hook);
        id
    }

    pub fn deregister_cancel_hook(&self, id: u64) {
        self.cancellations.lock().remove(&id);
    }

    pub fn enter_worker(&self) {
        self.n_threads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit_worker(&self) {
        if self.n_threads.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.n_threads.load(Ordering::SeqCst)
    }

    /// Block until every worker that called `enter_worker` has called
    /// `exit_worker` (spec.md §5, "thread-count barrier").
    pub async fn wait_for_idle(&self) {
        loop {
            if self.active_worker_count() == 0 {
                return;
            }
            let notified = self.idle.notified();
            if self.active_worker_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn transfers(&self) -> &SyncMutex<HashMap<String, Arc<TransferRecord>>> {
        &self.transfers
    }
}

/// RAII guard pairing `enter_worker`/`exit_worker` so every spawned task
/// is counted for the lifetime of its body, mirroring `n_threads` in
/// spec.md §3/§5.
pub struct WorkerGuard {
    state: Arc<SharedState>,
}

impl WorkerGuard {
    pub fn new(state: Arc<SharedState>) -> Self {
        state.enter_worker();
        Self { state }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.state.exit_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[tokio::test]
    async fn barrier_waits_for_all_workers() {
        let state = SharedState::new(vec![], 4096, SocketSettings::default());
        let guard1 = WorkerGuard::new(state.clone());
        let guard2 = WorkerGuard::new(state.clone());
        assert_eq!(state.active_worker_count(), 2);

        let waiter_state = state.clone();
        let waiter = tokio::spawn(async move { waiter_state.wait_for_idle().await });

        drop(guard1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard2);

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("barrier should resolve")
            .unwrap();
    }

    #[test]
    fn cancel_all_fires_every_hook_once() {
        let state = SharedState::new(vec![], 4096, SocketSettings::default());
        let fired = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            state.register_cancel_hook(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        state.cancel_all();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(state.is_cancelled());
    }
}
