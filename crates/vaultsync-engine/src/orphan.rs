//! Orphaned checkout detection and resolution.
//!
//! Believed locks are compared against fresh server state. A lock that is
//! gone while the version advanced becomes an [`OrphanedCheckout`], tracked
//! until the user resolves or dismisses it.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use vaultsync_core::orphan::{backup_path, check_lock};
use vaultsync_core::{
    BelievedLock, LockCheck, OrphanedCheckout, ResolutionAction, ServerRecord, ToastKind,
    VaultError,
};

use crate::batch::{run_batch, BatchOutcome};
use crate::context::VaultContext;
use crate::lock::{Checkout, CheckoutManager};
use crate::queue::OperationKind;

/// What a reconciliation pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub still_held: usize,
    /// Orphans first seen in this pass
    pub orphaned: Vec<OrphanedCheckout>,
    pub released: usize,
    pub missing: usize,
    /// Locks that could not be checked, e.g. while offline
    pub errors: usize,
}

pub struct OrphanResolver {
    ctx: Arc<VaultContext>,
    locks: CheckoutManager,
}

impl OrphanResolver {
    pub fn new(ctx: Arc<VaultContext>, locks: CheckoutManager) -> Self {
        Self { ctx, locks }
    }

    /// Check every believed lock against the server.
    ///
    /// Each check waits for in-flight operations on the file's path, so a
    /// checkin in progress is never mistaken for a remote one.
    #[instrument(skip(self), level = "debug")]
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for believed in self.ctx.store.believed_locks() {
            report.checked += 1;
            let result = self
                .checked(&believed.file_id, &believed.relative_path, |believed| async move {
                    let server = self.ctx.backend.get_file(&believed.file_id).await?;
                    Ok(self.apply(&believed, server).await)
                })
                .await;
            match result {
                Ok(Some(LockCheck::StillHeld)) => report.still_held += 1,
                Ok(Some(LockCheck::Orphaned(orphan))) => report.orphaned.push(orphan),
                Ok(Some(LockCheck::Released)) => report.released += 1,
                Ok(Some(LockCheck::Missing)) => report.missing += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to check lock on {}: {}", believed.relative_path, e);
                    report.errors += 1;
                }
            }
        }

        if !report.orphaned.is_empty() {
            let message = match report.orphaned.as_slice() {
                [one] => format!(
                    "{} was checked in by {} while you had it checked out",
                    one.file_name,
                    one.checked_in_by.as_deref().unwrap_or("another user")
                ),
                many => format!("{} checked-out files were checked in elsewhere", many.len()),
            };
            self.ctx.notifier.add_toast(ToastKind::Warning, &message);
        }
        debug!(
            "Reconciled {} locks: {} held, {} orphaned, {} released",
            report.checked,
            report.still_held,
            report.orphaned.len(),
            report.released
        );
        report
    }

    /// Run detection for one file when a realtime update arrives.
    ///
    /// Returns the orphan if this update created one.
    pub async fn handle_remote_update(&self, server: ServerRecord) -> Option<OrphanedCheckout> {
        let Some(believed) = self.ctx.store.believed_lock(&server.id) else {
            self.ctx.store.upsert_server(server);
            return None;
        };
        let file_id = server.id.clone();
        let update = server.clone();
        let result = self
            .checked(&file_id, &believed.relative_path, |believed| async move {
                Ok(self.apply(&believed, Some(server)).await)
            })
            .await;
        match result {
            Ok(Some(LockCheck::Orphaned(orphan))) => {
                self.ctx.notifier.add_toast(
                    ToastKind::Warning,
                    &format!(
                        "{} was checked in by {} while you had it checked out",
                        orphan.file_name,
                        orphan.checked_in_by.as_deref().unwrap_or("another user")
                    ),
                );
                Some(orphan)
            }
            Ok(Some(_)) => None,
            Ok(None) => {
                // Lock dropped while waiting or orphan already tracked
                self.ctx.store.upsert_server(update);
                None
            }
            Err(e) => {
                warn!("Failed to check remote update of {}: {}", believed.relative_path, e);
                None
            }
        }
    }

    /// Run `check` on the file's path once the queue admits it, against the
    /// believed lock as it stands then. `None` if the lock was dropped while
    /// waiting, e.g. by the checkin that held the path.
    async fn checked<F, Fut>(
        &self,
        file_id: &str,
        relative_path: &str,
        check: F,
    ) -> Result<Option<LockCheck>, VaultError>
    where
        F: FnOnce(BelievedLock) -> Fut,
        Fut: Future<Output = Result<Option<LockCheck>, VaultError>>,
    {
        let paths = vec![relative_path.to_string()];
        let label = format!("reconcile {}", relative_path);
        self.ctx
            .queue
            .run(OperationKind::Reconcile, &label, &paths, || async move {
                match self.ctx.store.believed_lock(file_id) {
                    Some(believed) => check(believed).await,
                    None => Ok(None),
                }
            })
            .await
    }

    /// Fold one comparison into the store. `None` if the orphan it found was
    /// already tracked.
    async fn apply(&self, believed: &BelievedLock, server: Option<ServerRecord>) -> Option<LockCheck> {
        let check = check_lock(believed, server.as_ref(), &self.ctx.user_id);
        match &check {
            LockCheck::StillHeld => {
                if let Some(server) = server {
                    self.ctx.store.upsert_server(server);
                }
            }
            LockCheck::Orphaned(orphan) => {
                self.ctx.store.forget(&believed.file_id);
                if let Some(server) = server {
                    self.ctx.store.upsert_server(server);
                }
                if !self.ctx.store.add_orphan(orphan.clone()) {
                    return None;
                }
                info!(
                    "Checkout of {} orphaned by v{}",
                    orphan.local_path, orphan.new_version
                );
            }
            LockCheck::Released => {
                self.ctx.store.forget(&believed.file_id);
                if let Some(server) = server {
                    self.ctx.store.upsert_server(server);
                }
                if self.ctx.store.get(&believed.relative_path).and_then(|r| r.local).is_some() {
                    self.ctx.mirror_read_only(&believed.relative_path, true).await;
                }
            }
            LockCheck::Missing => {
                self.ctx.store.forget(&believed.file_id);
                self.ctx.store.remove_server(&believed.file_id);
            }
        }
        Some(check)
    }

    pub fn pending(&self) -> Vec<OrphanedCheckout> {
        self.ctx.store.orphans()
    }

    /// Drop an orphan without touching the server or the local file.
    pub fn dismiss(&self, file_id: &str) -> Result<OrphanedCheckout, VaultError> {
        let orphan = self
            .ctx
            .store
            .remove_orphan(file_id)
            .ok_or_else(|| VaultError::NotFound(format!("No orphaned checkout for {}", file_id)))?;
        self.ctx.notifier.add_toast(
            ToastKind::Info,
            &format!("Dismissed orphaned checkout of {}", orphan.file_name),
        );
        Ok(orphan)
    }

    /// Resolve one orphan and report the result in a toast.
    pub async fn resolve(&self, file_id: &str, action: ResolutionAction) -> Result<(), VaultError> {
        let name = self
            .ctx
            .store
            .orphan(file_id)
            .map(|o| o.file_name)
            .unwrap_or_else(|| file_id.to_string());
        match self.resolve_quietly(file_id, action).await {
            Ok(()) => {
                self.ctx
                    .notifier
                    .add_toast(ToastKind::Success, &format!("{} {}", action.verb(), name));
                Ok(())
            }
            Err(e) => {
                self.ctx.notifier.add_toast(
                    ToastKind::Error,
                    &format!("Failed to resolve {}: {}", name, e),
                );
                Err(e)
            }
        }
    }

    /// Apply one action to several orphans, one at a time.
    pub async fn resolve_many(&self, file_ids: Vec<String>, action: ResolutionAction) -> BatchOutcome {
        run_batch(
            self.ctx.notifier.as_ref(),
            action.verb(),
            file_ids,
            |id| {
                self.ctx
                    .store
                    .orphan(id)
                    .map(|o| o.local_path)
                    .unwrap_or_else(|| id.clone())
            },
            |id| async move { self.resolve_quietly(&id, action).await },
        )
        .await
    }

    /// The orphan stays tracked, with `last_error` set, unless the action's
    /// final step succeeded.
    async fn resolve_quietly(&self, file_id: &str, action: ResolutionAction) -> Result<(), VaultError> {
        let orphan = self
            .ctx
            .store
            .orphan(file_id)
            .ok_or_else(|| VaultError::NotFound(format!("No orphaned checkout for {}", file_id)))?;

        let mut paths = vec![orphan.local_path.clone()];
        if orphan.file_path != orphan.local_path {
            paths.push(orphan.file_path.clone());
        }
        let label = format!("{} {}", action.as_str(), orphan.file_name);
        let result = self
            .ctx
            .queue
            .run(OperationKind::Resolve, &label, &paths, || {
                self.execute(&orphan, action)
            })
            .await;

        match result {
            Ok(()) => {
                self.ctx.store.remove_orphan(file_id);
                info!("Resolved orphaned {} with {}", orphan.local_path, action.as_str());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to {} {}: {}", action.as_str(), orphan.local_path, e);
                self.ctx.store.set_orphan_error(file_id, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn execute(&self, orphan: &OrphanedCheckout, action: ResolutionAction) -> Result<(), VaultError> {
        match action {
            ResolutionAction::Discard => self.discard(orphan).await,
            ResolutionAction::ReCheckout => match self.locks.checkout(&orphan.local_path).await? {
                Checkout::Acquired | Checkout::AlreadyHeld => Ok(()),
            },
            ResolutionAction::BackupThenDiscard => {
                let backup = backup_path(&orphan.local_path, Utc::now());
                self.ctx.fs.copy(&orphan.local_path, &backup).await?;
                self.ctx.refresh_local(&backup).await?;
                debug!("Backed up {} to {}", orphan.local_path, backup);
                self.discard(orphan).await
            }
            ResolutionAction::UploadAsNew => {
                self.locks.checkout(&orphan.local_path).await?;
                self.locks
                    .checkin(
                        &orphan.local_path,
                        Some(format!(
                            "Replaces v{} checked in by {}",
                            orphan.new_version,
                            orphan.checked_in_by.as_deref().unwrap_or("another user")
                        )),
                    )
                    .await
                    .map(|_| ())
            }
        }
    }

    /// Delete the local copy and download the server's current version.
    async fn discard(&self, orphan: &OrphanedCheckout) -> Result<(), VaultError> {
        let server = self
            .ctx
            .backend
            .get_file(&orphan.file_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("{} is no longer on the server", orphan.file_path)))?;

        self.ctx.fs.delete(&orphan.local_path).await?;
        self.ctx.store.set_baseline(&orphan.local_path, None);
        self.ctx.store.remove_local(&orphan.local_path);
        self.ctx.pull(&server, &server.path).await?;
        Ok(())
    }
}
