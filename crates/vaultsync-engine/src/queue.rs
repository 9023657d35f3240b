//! Path-conflict guard for filesystem operations.
//!
//! One global FIFO. An operation starts immediately when nothing is waiting
//! and none of its paths overlap an in-flight operation; otherwise it waits
//! its turn. The head of the queue blocks everything behind it, even
//! operations on disjoint paths.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use vaultsync_core::paths;
use vaultsync_core::{Result, VaultError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Checkout,
    Checkin,
    UndoCheckout,
    Download,
    Upload,
    Rename,
    DeleteLocal,
    DeleteServer,
    ForceCheckin,
    Resolve,
    Reconcile,
    Repair,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Checkout => "checkout",
            OperationKind::Checkin => "checkin",
            OperationKind::UndoCheckout => "undo-checkout",
            OperationKind::Download => "download",
            OperationKind::Upload => "upload",
            OperationKind::Rename => "rename",
            OperationKind::DeleteLocal => "delete-local",
            OperationKind::DeleteServer => "delete-server",
            OperationKind::ForceCheckin => "force-checkin",
            OperationKind::Resolve => "resolve",
            OperationKind::Reconcile => "reconcile",
            OperationKind::Repair => "repair",
        }
    }
}

/// A detached operation for [`OperationQueue::submit`].
pub struct QueuedOperation {
    pub kind: OperationKind,
    pub label: String,
    pub paths: Vec<String>,
    pub execute: BoxFuture<'static, Result<()>>,
}

/// Snapshot of one queued or running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub label: String,
    pub paths: Vec<String>,
    pub running: bool,
}

struct Entry {
    kind: OperationKind,
    label: String,
    paths: Vec<String>,
}

struct Waiter {
    id: u64,
    entry: Entry,
    admit: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    in_flight: HashMap<u64, Entry>,
    waiting: VecDeque<Waiter>,
}

impl QueueState {
    fn conflicts(&self, paths: &[String]) -> bool {
        self.in_flight
            .values()
            .any(|entry| paths::any_overlap(paths, &entry.paths))
    }

    /// Admit waiters from the head while they do not conflict.
    fn drain(&mut self) {
        while let Some(head) = self.waiting.front() {
            if self.conflicts(&head.entry.paths) {
                break;
            }
            let Some(waiter) = self.waiting.pop_front() else {
                break;
            };
            debug!("Admitting queued {} ({})", waiter.entry.kind.as_str(), waiter.entry.label);
            self.in_flight.insert(waiter.id, waiter.entry);
            if waiter.admit.send(()).is_err() {
                // The caller gave up while waiting
                self.in_flight.remove(&waiter.id);
            }
        }
    }
}

#[derive(Default)]
pub struct OperationQueue {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
}

/// Releases an operation's slot, queued or running, when dropped.
struct Slot<'a> {
    queue: &'a OperationQueue,
    id: u64,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.queue.state.lock() {
            state.in_flight.remove(&self.id);
            state.waiting.retain(|w| w.id != self.id);
            state.drain();
        }
    }
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| VaultError::Internal("Operation queue state poisoned".to_string()))
    }

    /// True if any of `paths` equals, contains or lies under a path of an
    /// in-flight operation.
    pub fn has_path_conflict<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        let paths: Vec<String> = paths.iter().map(|p| paths::normalize(p.as_ref())).collect();
        self.state().map(|s| s.conflicts(&paths)).unwrap_or(false)
    }

    /// Run `op` once admitted and return its result.
    ///
    /// The slot is released when `op` finishes or when the returned future is
    /// dropped, whichever comes first.
    pub async fn run<T, F, Fut>(
        &self,
        kind: OperationKind,
        label: &str,
        paths: &[String],
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            kind,
            label: label.to_string(),
            paths: paths.iter().map(|p| paths::normalize(p)).collect(),
        };

        let admission = {
            let mut state = self.state()?;
            if state.waiting.is_empty() && !state.conflicts(&entry.paths) {
                state.in_flight.insert(id, entry);
                None
            } else {
                debug!(
                    "{} ({}) queued: {}",
                    kind.as_str(),
                    label,
                    VaultError::PathConflict(entry.paths.join(", "))
                );
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(Waiter {
                    id,
                    entry,
                    admit: tx,
                });
                Some(rx)
            }
        };
        let _slot = Slot { queue: self, id };

        if let Some(rx) = admission {
            rx.await
                .map_err(|_| VaultError::Internal("Operation queue dropped a waiter".to_string()))?;
        }
        op().await
    }

    /// Queue a detached operation; the handle resolves with its result.
    pub fn submit(self: &Arc<Self>, operation: QueuedOperation) -> JoinHandle<Result<()>> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let QueuedOperation {
                kind,
                label,
                paths,
                execute,
            } = operation;
            queue.run(kind, &label, &paths, || execute).await
        })
    }

    /// Running operations first, then waiters in queue order.
    pub fn pending(&self) -> Vec<PendingOperation> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        let mut running: Vec<(u64, PendingOperation)> = state
            .in_flight
            .iter()
            .map(|(id, e)| {
                (
                    *id,
                    PendingOperation {
                        kind: e.kind,
                        label: e.label.clone(),
                        paths: e.paths.clone(),
                        running: true,
                    },
                )
            })
            .collect();
        running.sort_by_key(|(id, _)| *id);

        running
            .into_iter()
            .map(|(_, op)| op)
            .chain(state.waiting.iter().map(|w| PendingOperation {
                kind: w.entry.kind,
                label: w.entry.label.clone(),
                paths: w.entry.paths.clone(),
                running: false,
            }))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.state()
            .map(|s| s.in_flight.is_empty() && s.waiting.is_empty())
            .unwrap_or(true)
    }
}
