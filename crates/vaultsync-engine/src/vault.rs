//! Command facade over one vault.
//!
//! Every command that touches the local tree is admitted through the
//! operation queue with the paths it affects, checks legality before any
//! state-mutating call, and leaves the store re-classified.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};
use vaultsync_core::rules::{self, Affordances, Blocked};
use vaultsync_core::{
    paths, ActivityAction, IgnoreRules, LocalFileSystem, NewFile, Notifier, OrphanedCheckout,
    ResolutionAction, ServerRecord, SyncBaseline, VaultBackend, VaultError,
};

use crate::batch::{run_batch, BatchOutcome};
use crate::context::VaultContext;
use crate::disk::content_hash;
use crate::lock::{Checkout, CheckoutManager};
use crate::orphan::{OrphanResolver, ReconcileReport};
use crate::queue::{OperationKind, OperationQueue};
use crate::repair::{repair_read_only, RepairReport};
use crate::serial::SerialCounter;
use crate::store::{FileStore, PersistedState, StoreEvent};

/// Identity of a vault session.
#[derive(Debug, Clone)]
pub struct VaultOptions {
    pub vault_id: String,
    pub org_id: String,
    pub user_id: String,
    pub ignore: IgnoreRules,
}

/// One file in a confirmed server delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDelete {
    pub file_id: String,
    pub relative_path: String,
    pub version: u32,
}

/// The files a server delete would remove, for the user to confirm.
///
/// [`Vault::delete_from_server`] only accepts a plan, so nothing is deleted
/// from the server without its list having been produced first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletePlan {
    pub files: Vec<PlannedDelete>,
    pub blocked: Vec<(String, Blocked)>,
}

impl DeletePlan {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub struct Vault {
    ctx: Arc<VaultContext>,
    locks: CheckoutManager,
    orphans: OrphanResolver,
    serial: SerialCounter,
}

impl Vault {
    pub fn new(
        backend: Arc<dyn VaultBackend>,
        fs: Arc<dyn LocalFileSystem>,
        notifier: Arc<dyn Notifier>,
        options: VaultOptions,
    ) -> Self {
        let serial = SerialCounter::new(backend.clone(), options.org_id.clone());
        let ctx = Arc::new(VaultContext {
            backend,
            fs,
            notifier,
            store: FileStore::new(options.ignore),
            queue: OperationQueue::new(),
            user_id: options.user_id,
            vault_id: options.vault_id,
            org_id: options.org_id,
        });
        let locks = CheckoutManager::new(ctx.clone());
        let orphans = OrphanResolver::new(ctx.clone(), locks.clone());
        Self {
            ctx,
            locks,
            orphans,
            serial,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.ctx.user_id
    }

    pub fn vault_id(&self) -> &str {
        &self.ctx.vault_id
    }

    pub fn store(&self) -> &FileStore {
        &self.ctx.store
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.ctx.queue
    }

    pub fn serial(&self) -> &SerialCounter {
        &self.serial
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.ctx.store.subscribe()
    }

    pub fn export_state(&self) -> PersistedState {
        self.ctx.store.export_state()
    }

    pub fn import_state(&self, state: PersistedState) {
        self.ctx.store.import_state(state);
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Rescan the vault, relist the server and rebuild every record.
    #[instrument(skip(self), level = "debug")]
    pub async fn refresh(&self) -> Result<usize, VaultError> {
        self.ctx
            .queue
            .run(OperationKind::Repair, "refresh", &[String::new()], || async {
                let (local, server) = futures::try_join!(
                    self.ctx.fs.scan(),
                    self.ctx.backend.list_files(&self.ctx.vault_id)
                )?;
                self.ctx.store.apply_snapshot(local, server);
                Ok::<_, VaultError>(self.ctx.store.len())
            })
            .await
    }

    /// Fold a filesystem event for one path into the store.
    pub async fn local_changed(&self, relative_path: &str) -> Result<(), VaultError> {
        self.ctx.refresh_local(relative_path).await.map(|_| ())
    }

    pub fn affordances(&self, relative_path: &str) -> Result<Affordances, VaultError> {
        let record = self.ctx.record(relative_path)?;
        Ok(rules::affordances(&record, &self.ctx.user_id))
    }

    /// Expand folders to the files below them, dropping duplicates. Paths
    /// unknown to the store are kept so the batch reports them.
    fn select(&self, relative_paths: &[String]) -> Vec<String> {
        let mut selected = BTreeSet::new();
        for path in relative_paths {
            let path = paths::normalize(path);
            let is_folder = self
                .ctx
                .store
                .get(&path)
                .map(|r| r.is_directory)
                .unwrap_or(false);
            let below: Vec<String> = self
                .ctx
                .store
                .under(&path)
                .into_iter()
                .filter(|r| !r.is_directory && (is_folder || r.relative_path != path))
                .map(|r| r.relative_path)
                .collect();
            if is_folder || (self.ctx.store.get(&path).is_none() && !below.is_empty()) {
                selected.extend(below);
            } else {
                selected.insert(path);
            }
        }
        selected.into_iter().collect()
    }

    fn label(verb: &str, paths: &[String]) -> String {
        match paths {
            [one] => format!("{} {}", verb, one),
            many => format!("{} {} files", verb, many.len()),
        }
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub async fn checkout_file(&self, relative_path: &str) -> Result<Checkout, VaultError> {
        let paths = vec![paths::normalize(relative_path)];
        self.ctx
            .queue
            .run(OperationKind::Checkout, &Self::label("Check out", &paths), &paths, || {
                self.locks.checkout(&paths[0])
            })
            .await
    }

    pub async fn checkin_file(
        &self,
        relative_path: &str,
        comment: Option<String>,
    ) -> Result<ServerRecord, VaultError> {
        let paths = vec![paths::normalize(relative_path)];
        self.ctx
            .queue
            .run(OperationKind::Checkin, &Self::label("Check in", &paths), &paths, || {
                self.locks.checkin(&paths[0], comment)
            })
            .await
    }

    pub async fn checkout(&self, relative_paths: &[String]) -> Result<BatchOutcome, VaultError> {
        let selected = self.select(relative_paths);
        let items = selected.clone();
        self.ctx
            .queue
            .run(OperationKind::Checkout, &Self::label("Check out", &selected), &selected, || async move {
                Ok::<_, VaultError>(self.locks.checkout_many(items).await)
            })
            .await
    }

    pub async fn checkin(
        &self,
        relative_paths: &[String],
        comment: Option<String>,
    ) -> Result<BatchOutcome, VaultError> {
        let selected = self.select(relative_paths);
        let items = selected.clone();
        self.ctx
            .queue
            .run(OperationKind::Checkin, &Self::label("Check in", &selected), &selected, || async move {
                Ok::<_, VaultError>(self.locks.checkin_many(items, comment).await)
            })
            .await
    }

    pub async fn undo_checkout(&self, relative_paths: &[String]) -> Result<BatchOutcome, VaultError> {
        let selected = self.select(relative_paths);
        let items = selected.clone();
        self.ctx
            .queue
            .run(
                OperationKind::UndoCheckout,
                &Self::label("Undo checkout of", &selected),
                &selected,
                || async move { Ok::<_, VaultError>(self.locks.undo_checkout_many(items).await) },
            )
            .await
    }

    /// Administrative release of someone else's checkout.
    pub async fn force_checkin(&self, relative_path: &str) -> Result<ServerRecord, VaultError> {
        let paths = vec![paths::normalize(relative_path)];
        self.ctx
            .queue
            .run(
                OperationKind::ForceCheckin,
                &Self::label("Force check in", &paths),
                &paths,
                || self.locks.force_checkin(&paths[0]),
            )
            .await
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Fetch server content for cloud, outdated or locally deleted files.
    pub async fn download(&self, relative_paths: &[String]) -> Result<BatchOutcome, VaultError> {
        let selected = self.select(relative_paths);
        let items = selected.clone();
        self.ctx
            .queue
            .run(OperationKind::Download, &Self::label("Download", &selected), &selected, || async move {
                Ok::<_, VaultError>(run_batch(
                    self.ctx.notifier.as_ref(),
                    "Downloaded",
                    items,
                    |p| p.clone(),
                    |p| async move { self.download_one(&p).await },
                )
                .await)
            })
            .await
    }

    async fn download_one(&self, relative_path: &str) -> Result<(), VaultError> {
        let record = self.ctx.record(relative_path)?;
        rules::can_download(&record).map_err(|b| b.into_error(relative_path))?;
        let server = record
            .server
            .as_ref()
            .ok_or_else(|| VaultError::NotFound(format!("{} has no server record", relative_path)))?;
        self.ctx.pull(server, &record.relative_path).await?;
        Ok(())
    }

    /// First upload of files that exist only locally.
    pub async fn upload_new(&self, relative_paths: &[String]) -> Result<BatchOutcome, VaultError> {
        let selected = self.select(relative_paths);
        let items = selected.clone();
        self.ctx
            .queue
            .run(OperationKind::Upload, &Self::label("Upload", &selected), &selected, || async move {
                Ok::<_, VaultError>(run_batch(
                    self.ctx.notifier.as_ref(),
                    "Uploaded",
                    items,
                    |p| p.clone(),
                    |p| async move { self.upload_one(&p).await },
                )
                .await)
            })
            .await
    }

    async fn upload_one(&self, relative_path: &str) -> Result<(), VaultError> {
        let record = self.ctx.record(relative_path)?;
        rules::can_upload(&record).map_err(|b| b.into_error(relative_path))?;

        let data = self.ctx.fs.read(&record.relative_path).await?;
        let hash = content_hash(&data);
        self.ctx.backend.put_blob(&hash, &data).await?;
        let created = self
            .ctx
            .backend
            .create_file(
                &self.ctx.vault_id,
                &self.ctx.user_id,
                NewFile {
                    path: record.relative_path.clone(),
                    name: paths::file_name(&record.relative_path).to_string(),
                    content_hash: hash,
                    size: data.len() as u64,
                },
            )
            .await?;

        self.ctx.mirror_read_only(&record.relative_path, true).await;
        self.ctx
            .store
            .set_baseline(&record.relative_path, SyncBaseline::from_server(&created));
        self.ctx.store.upsert_server(created.clone());
        self.ctx.refresh_local(&record.relative_path).await?;
        self.ctx.audit(ActivityAction::Create, &created, None).await;
        debug!("Uploaded {} as {}", record.relative_path, created.id);
        Ok(())
    }

    // =========================================================================
    // Local tree
    // =========================================================================

    /// Move a local file or folder. Synced files need the lock; the new path
    /// reaches the server on checkin.
    #[instrument(skip(self), level = "debug")]
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), VaultError> {
        let from = paths::normalize(from);
        let to = paths::normalize(to);
        let affected = vec![from.clone(), to.clone()];
        self.ctx
            .queue
            .run(
                OperationKind::Rename,
                &format!("Rename {} to {}", from, to),
                &affected,
                || async {
                    let record = self.ctx.record(&from)?;
                    let moved = if record.is_directory {
                        self.ctx.store.under(&from)
                    } else {
                        vec![record.clone()]
                    };
                    let allowed = if record.is_directory {
                        rules::can_rename_folder(&record, &moved, &self.ctx.user_id)
                    } else {
                        rules::can_rename(&record, &self.ctx.user_id)
                    };
                    allowed.map_err(|b| b.into_error(&from))?;
                    if self.ctx.fs.stat(&to).await?.is_some() {
                        return Err(VaultError::InvalidArgument(format!("{} already exists", to)));
                    }

                    self.ctx.fs.rename(&from, &to).await?;
                    if record.is_directory {
                        let (local, server) = futures::try_join!(
                            self.ctx.fs.scan(),
                            self.ctx.backend.list_files(&self.ctx.vault_id)
                        )?;
                        self.ctx.store.apply_snapshot(local, server);
                    } else {
                        self.ctx.store.rename(&from, &to);
                        self.ctx.refresh_local(&to).await?;
                    }
                    for mut lock in self.ctx.store.believed_locks() {
                        if let Some(moved) = paths::rebase(&lock.relative_path, &from, &to) {
                            debug!("Believed lock {} moved to {}", lock.relative_path, moved);
                            lock.relative_path = moved;
                            self.ctx.store.believe(lock);
                        }
                    }
                    for file in moved.iter().filter(|r| !r.is_directory) {
                        let (Some(server), Some(target)) =
                            (&file.server, paths::rebase(&file.relative_path, &from, &to))
                        else {
                            continue;
                        };
                        self.ctx
                            .audit(ActivityAction::Rename, server, Some(format!("Moved locally to {}", target)))
                            .await;
                    }
                    info!("Renamed {} to {}", from, to);
                    Ok::<(), VaultError>(())
                },
            )
            .await
    }

    /// Remove local copies; synced files become `cloud`.
    pub async fn delete_local(&self, relative_paths: &[String]) -> Result<BatchOutcome, VaultError> {
        let selected = self.select(relative_paths);
        let items = selected.clone();
        self.ctx
            .queue
            .run(OperationKind::DeleteLocal, &Self::label("Delete", &selected), &selected, || async move {
                Ok::<_, VaultError>(run_batch(
                    self.ctx.notifier.as_ref(),
                    "Deleted",
                    items,
                    |p| p.clone(),
                    |p| async move { self.delete_local_one(&p).await },
                )
                .await)
            })
            .await
    }

    async fn delete_local_one(&self, relative_path: &str) -> Result<(), VaultError> {
        let record = self.ctx.record(relative_path)?;
        rules::can_delete_local(&record, &self.ctx.user_id).map_err(|b| b.into_error(relative_path))?;
        self.ctx.fs.delete(&record.relative_path).await?;
        self.ctx.store.set_baseline(&record.relative_path, None);
        self.ctx.refresh_local(&record.relative_path).await?;
        Ok(())
    }

    // =========================================================================
    // Server delete
    // =========================================================================

    /// List what a server delete of `relative_paths` would remove.
    pub fn plan_server_delete(&self, relative_paths: &[String]) -> DeletePlan {
        let mut plan = DeletePlan::default();
        for path in self.select(relative_paths) {
            let Some(record) = self.ctx.store.get(&path) else {
                plan.blocked.push((path, Blocked::NotOnServer));
                continue;
            };
            match rules::can_delete_from_server(&record, &self.ctx.user_id) {
                Ok(()) => {
                    if let Some(server) = &record.server {
                        plan.files.push(PlannedDelete {
                            file_id: server.id.clone(),
                            relative_path: record.relative_path.clone(),
                            version: server.version,
                        });
                    }
                }
                Err(reason) => plan.blocked.push((path, reason)),
            }
        }
        plan
    }

    /// Execute a confirmed plan: soft-delete each file on the server and
    /// remove its local copy.
    pub async fn delete_from_server(&self, plan: DeletePlan) -> Result<BatchOutcome, VaultError> {
        let affected: Vec<String> = plan.files.iter().map(|f| f.relative_path.clone()).collect();
        self.ctx
            .queue
            .run(
                OperationKind::DeleteServer,
                &Self::label("Delete from server", &affected),
                &affected,
                || async move {
                    Ok::<_, VaultError>(run_batch(
                        self.ctx.notifier.as_ref(),
                        "Deleted from server",
                        plan.files,
                        |f| f.relative_path.clone(),
                        |f| async move { self.delete_server_one(&f).await },
                    )
                    .await)
                },
            )
            .await
    }

    async fn delete_server_one(&self, planned: &PlannedDelete) -> Result<(), VaultError> {
        let record = self
            .ctx
            .store
            .find_by_id(&planned.file_id)
            .ok_or_else(|| VaultError::NotFound(format!("{} is no longer tracked", planned.relative_path)))?;
        rules::can_delete_from_server(&record, &self.ctx.user_id)
            .map_err(|b| b.into_error(&record.relative_path))?;

        self.ctx
            .backend
            .delete_file(&planned.file_id, &self.ctx.user_id)
            .await?;
        if let Some(server) = &record.server {
            self.ctx.audit(ActivityAction::Delete, server, None).await;
        }
        self.ctx.store.forget(&planned.file_id);
        self.ctx.store.remove_orphan(&planned.file_id);

        if record.local.is_some() {
            self.ctx.fs.delete(&record.relative_path).await?;
        }
        self.ctx.store.set_baseline(&record.relative_path, None);
        self.ctx.store.remove_local(&record.relative_path);
        self.ctx.store.remove_server(&planned.file_id);
        Ok(())
    }

    // =========================================================================
    // Orphans
    // =========================================================================

    pub async fn reconcile(&self) -> ReconcileReport {
        self.orphans.reconcile().await
    }

    pub async fn handle_remote_update(&self, server: ServerRecord) -> Option<OrphanedCheckout> {
        self.orphans.handle_remote_update(server).await
    }

    pub fn orphans(&self) -> Vec<OrphanedCheckout> {
        self.orphans.pending()
    }

    pub async fn resolve_orphan(&self, file_id: &str, action: ResolutionAction) -> Result<(), VaultError> {
        self.orphans.resolve(file_id, action).await
    }

    pub async fn resolve_orphans(&self, file_ids: Vec<String>, action: ResolutionAction) -> BatchOutcome {
        self.orphans.resolve_many(file_ids, action).await
    }

    pub fn dismiss_orphan(&self, file_id: &str) -> Result<OrphanedCheckout, VaultError> {
        self.orphans.dismiss(file_id)
    }

    // =========================================================================
    // Repair
    // =========================================================================

    pub async fn repair_read_only(&self) -> Result<RepairReport, VaultError> {
        self.ctx
            .queue
            .run(OperationKind::Repair, "repair read-only", &[String::new()], || async {
                Ok::<_, VaultError>(repair_read_only(&self.ctx).await)
            })
            .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tempfile::TempDir;
    use vaultsync_core::IgnoreRules;

    use super::{Vault, VaultOptions};
    use crate::batch::test_support::RecordingNotifier;
    use crate::disk::LocalDisk;
    use crate::memory::MemoryBackend;

    pub struct Harness {
        pub vault: Vault,
        pub disk: Arc<LocalDisk>,
        pub notifier: Arc<RecordingNotifier>,
        _dir: TempDir,
    }

    pub fn vault_for(backend: &Arc<MemoryBackend>, user: &str) -> Harness {
        let dir = TempDir::new().unwrap();
        let disk = Arc::new(LocalDisk::new(dir.path()));
        let notifier = Arc::new(RecordingNotifier::default());
        let vault = Vault::new(
            backend.clone(),
            disk.clone(),
            notifier.clone(),
            VaultOptions {
                vault_id: "vault-1".into(),
                org_id: "org-1".into(),
                user_id: user.into(),
                ignore: IgnoreRules::empty(),
            },
        );
        Harness {
            vault,
            disk,
            notifier,
            _dir: dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{vault_for, Harness};
    use super::*;
    use crate::disk::LocalDisk;
    use crate::memory::MemoryBackend;
    use vaultsync_core::{CheckinRequest, DiffStatus};

    fn p(path: &str) -> Vec<String> {
        vec![path.to_string()]
    }

    /// Alice creates `parts/x.txt` and uploads it.
    async fn seeded() -> (Arc<MemoryBackend>, Harness) {
        let backend = Arc::new(MemoryBackend::new());
        let alice = vault_for(&backend, "alice");
        alice.disk.write("parts/x.txt", b"version one").await.unwrap();
        alice.vault.refresh().await.unwrap();
        let outcome = alice.vault.upload_new(&p("parts/x.txt")).await.unwrap();
        assert!(outcome.is_complete_success());
        (backend, alice)
    }

    async fn local_hash(h: &Harness, path: &str) -> String {
        content_hash(&h.disk.read(path).await.unwrap())
    }

    #[tokio::test]
    async fn test_upload_new_is_synced_and_read_only() {
        let (_backend, alice) = seeded().await;
        let record = alice.vault.store().get("parts/x.txt").unwrap();
        assert_eq!(record.diff_status(), DiffStatus::None);
        assert_eq!(record.server.as_ref().unwrap().version, 1);
        assert!(alice.disk.is_read_only("parts/x.txt").await.unwrap());
        assert_eq!(alice.notifier.messages(), vec!["Uploaded 1/1 file"]);
    }

    #[tokio::test]
    async fn test_checkout_checkin_round_trip() {
        let (backend, alice) = seeded().await;

        assert_eq!(
            alice.vault.checkout_file("parts/x.txt").await.unwrap(),
            Checkout::Acquired
        );
        assert!(!alice.disk.is_read_only("parts/x.txt").await.unwrap());
        assert_eq!(
            alice.vault.checkout_file("parts/x.txt").await.unwrap(),
            Checkout::AlreadyHeld
        );

        alice.disk.write("parts/x.txt", b"version two").await.unwrap();
        alice.vault.local_changed("parts/x.txt").await.unwrap();
        assert_eq!(
            alice.vault.store().get("parts/x.txt").unwrap().diff_status(),
            DiffStatus::Modified
        );

        let updated = alice.vault.checkin_file("parts/x.txt", None).await.unwrap();
        assert_eq!(updated.checked_out_by, None);
        assert_eq!(updated.version, 2);
        assert_eq!(
            updated.content_hash.as_deref(),
            Some(content_hash(b"version two").as_str())
        );
        assert!(alice.disk.is_read_only("parts/x.txt").await.unwrap());
        assert_eq!(
            alice.vault.store().get("parts/x.txt").unwrap().diff_status(),
            DiffStatus::None
        );
        assert!(alice.vault.store().believed_locks().is_empty());

        let actions: Vec<ActivityAction> = backend.activity().iter().map(|a| a.action).collect();
        assert_eq!(
            actions,
            vec![ActivityAction::Create, ActivityAction::Checkout, ActivityAction::Checkin]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkout_has_one_winner() {
        let (backend, alice) = seeded().await;
        let bob = vault_for(&backend, "bob");
        bob.vault.refresh().await.unwrap();
        bob.vault.download(&p("parts/x.txt")).await.unwrap();
        alice.vault.refresh().await.unwrap();

        let (a, b) = tokio::join!(
            alice.vault.checkout_file("parts/x.txt"),
            bob.vault.checkout_file("parts/x.txt")
        );
        let results = [a, b];
        let winners = results.iter().filter(|r| matches!(r, Ok(Checkout::Acquired))).count();
        let losers = results
            .iter()
            .filter(|r| matches!(r, Err(VaultError::AlreadyLocked { .. })))
            .count();
        assert_eq!((winners, losers), (1, 1));
    }

    #[tokio::test]
    async fn test_checkin_by_non_owner_rejected() {
        let (backend, alice) = seeded().await;
        let bob = vault_for(&backend, "bob");
        bob.vault.refresh().await.unwrap();
        bob.vault.download(&p("parts/x.txt")).await.unwrap();

        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        bob.vault.refresh().await.unwrap();

        let err = bob.vault.checkin_file("parts/x.txt", None).await.unwrap_err();
        assert!(matches!(err, VaultError::NotOwner(_)));
        assert!(bob.disk.is_read_only("parts/x.txt").await.unwrap());

        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();
        let err = backend
            .checkin(&file_id, "bob", CheckinRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotOwner(_)));

        let server = backend.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(server.checked_out_by.as_deref(), Some("alice"));
        assert_eq!(server.version, 1);

        let affordances = bob.vault.affordances("parts/x.txt").unwrap();
        assert_eq!(affordances.checkout, Err(Blocked::LockedBy("alice".into())));
    }

    #[tokio::test]
    async fn test_undo_checkout_restores_read_only() {
        let (_backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        let outcome = alice.vault.undo_checkout(&p("parts/x.txt")).await.unwrap();
        assert!(outcome.is_complete_success());
        assert!(alice.disk.is_read_only("parts/x.txt").await.unwrap());
        let server = alice.vault.store().get("parts/x.txt").unwrap().server.unwrap();
        assert_eq!(server.checked_out_by, None);
        assert_eq!(server.version, 1);
    }

    #[tokio::test]
    async fn test_orphaned_checkout_discard() {
        let (backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        alice.disk.write("parts/x.txt", b"alice's edit").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();

        // An administrator elsewhere publishes version 2 over alice's lock
        let v2 = b"admin's version";
        let v2_hash = content_hash(v2);
        backend.put_blob(&v2_hash, v2).await.unwrap();
        backend
            .force_checkin(
                &file_id,
                "admin",
                CheckinRequest {
                    new_content_hash: Some(v2_hash.clone()),
                    new_file_size: Some(v2.len() as u64),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let report = alice.vault.reconcile().await;
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].new_version, 2);
        assert_eq!(report.orphaned[0].checked_in_by.as_deref(), Some("admin"));
        let again = alice.vault.reconcile().await;
        assert!(again.orphaned.is_empty());
        assert_eq!(alice.vault.orphans().len(), 1);

        alice
            .vault
            .resolve_orphan(&file_id, ResolutionAction::Discard)
            .await
            .unwrap();
        assert_eq!(local_hash(&alice, "parts/x.txt").await, v2_hash);
        assert!(alice.vault.orphans().is_empty());
        assert!(alice.disk.is_read_only("parts/x.txt").await.unwrap());
        assert_eq!(
            alice.vault.store().get("parts/x.txt").unwrap().diff_status(),
            DiffStatus::None
        );
    }

    #[tokio::test]
    async fn test_backup_then_discard_keeps_edit() {
        let (backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        alice.disk.write("parts/x.txt", b"alice's edit").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();
        backend
            .force_checkin(&file_id, "admin", CheckinRequest::default())
            .await
            .unwrap();
        alice.vault.reconcile().await;

        alice
            .vault
            .resolve_orphan(&file_id, ResolutionAction::BackupThenDiscard)
            .await
            .unwrap();

        let backups: Vec<String> = alice
            .vault
            .store()
            .under("parts")
            .into_iter()
            .map(|r| r.relative_path)
            .filter(|p| p.contains(".backup-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            local_hash(&alice, &backups[0]).await,
            content_hash(b"alice's edit")
        );
        assert_eq!(local_hash(&alice, "parts/x.txt").await, content_hash(b"version one"));
    }

    #[tokio::test]
    async fn test_upload_as_new_publishes_local_content() {
        let (backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        alice.disk.write("parts/x.txt", b"alice's edit").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();
        backend
            .force_checkin(&file_id, "admin", CheckinRequest::default())
            .await
            .unwrap();
        alice.vault.reconcile().await;

        alice
            .vault
            .resolve_orphan(&file_id, ResolutionAction::UploadAsNew)
            .await
            .unwrap();
        let server = backend.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(server.version, 3);
        assert_eq!(server.checked_out_by, None);
        assert_eq!(
            server.content_hash.as_deref(),
            Some(content_hash(b"alice's edit").as_str())
        );
    }

    #[tokio::test]
    async fn test_bulk_recheckout_with_one_failure() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = vault_for(&backend, "alice");
        let names = ["a.txt", "b.txt", "c.txt"];
        for name in names {
            alice.disk.write(name, name.as_bytes()).await.unwrap();
        }
        alice.vault.refresh().await.unwrap();
        let all: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        alice.vault.upload_new(&all).await.unwrap();
        alice.vault.checkout(&all).await.unwrap();

        let mut ids = vec![];
        for name in names {
            let id = alice.vault.store().get(name).unwrap().file_id().unwrap().to_string();
            backend
                .force_checkin(&id, "admin", CheckinRequest::default())
                .await
                .unwrap();
            ids.push(id);
        }
        assert_eq!(alice.vault.reconcile().await.orphaned.len(), 3);

        backend.inject_failure("try_checkout", &ids[1]);
        let outcome = alice
            .vault
            .resolve_orphans(ids.clone(), ResolutionAction::ReCheckout)
            .await;

        assert_eq!(outcome.succeeded.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "b.txt");
        assert!(matches!(outcome.failed[0].1, VaultError::Network(_)));

        let remaining = alice.vault.orphans();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].file_id, ids[1]);
        assert!(remaining[0].last_error.is_some());

        let messages = alice.notifier.messages();
        assert_eq!(
            messages.last().map(String::as_str),
            Some("Re-checked out 2/3 files, 1 failed")
        );
        assert!(!alice.disk.is_read_only("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_and_delete_local() {
        let (backend, _alice) = seeded().await;
        let bob = vault_for(&backend, "bob");
        bob.vault.refresh().await.unwrap();
        assert_eq!(
            bob.vault.store().get("parts/x.txt").unwrap().diff_status(),
            DiffStatus::Cloud
        );

        // Folder selection expands to the files below it
        let outcome = bob.vault.download(&p("parts")).await.unwrap();
        assert_eq!(outcome.succeeded, vec!["parts/x.txt"]);
        assert!(bob.disk.is_read_only("parts/x.txt").await.unwrap());

        bob.vault.delete_local(&p("parts/x.txt")).await.unwrap();
        assert!(bob.disk.stat("parts/x.txt").await.unwrap().is_none());
        assert_eq!(
            bob.vault.store().get("parts/x.txt").unwrap().diff_status(),
            DiffStatus::Cloud
        );
    }

    #[tokio::test]
    async fn test_download_refuses_local_edits() {
        let (_backend, alice) = seeded().await;
        alice.disk.set_read_only("parts/x.txt", false).await.unwrap();
        alice.disk.write("parts/x.txt", b"unsanctioned edit").await.unwrap();
        alice.vault.local_changed("parts/x.txt").await.unwrap();

        let outcome = alice.vault.download(&p("parts/x.txt")).await.unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(
            local_hash(&alice, "parts/x.txt").await,
            content_hash(b"unsanctioned edit")
        );
    }

    #[tokio::test]
    async fn test_rename_published_on_checkin() {
        let (backend, alice) = seeded().await;
        assert!(matches!(
            alice.vault.rename("parts/x.txt", "parts/y.txt").await,
            Err(VaultError::NotOwner(_))
        ));

        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        alice.vault.rename("parts/x.txt", "parts/y.txt").await.unwrap();
        assert_eq!(
            alice.vault.store().get("parts/y.txt").unwrap().diff_status(),
            DiffStatus::Moved
        );
        let renamed = backend.activity().into_iter().last().unwrap();
        assert_eq!(renamed.action, ActivityAction::Rename);
        assert_eq!(renamed.file_path, "parts/x.txt");
        assert_eq!(renamed.details.as_deref(), Some("Moved locally to parts/y.txt"));

        let updated = alice.vault.checkin_file("parts/y.txt", None).await.unwrap();
        assert_eq!(updated.path, "parts/y.txt");
        assert_eq!(updated.name, "y.txt");
        let listed = backend.list_files("vault-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            alice.vault.store().get("parts/y.txt").unwrap().diff_status(),
            DiffStatus::None
        );
    }

    #[tokio::test]
    async fn test_folder_rename_moves_believed_locks() {
        let (_backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();

        alice.vault.rename("parts", "assemblies").await.unwrap();
        assert_eq!(
            alice.vault.store().believed_lock(&file_id).unwrap().relative_path,
            "assemblies/x.txt"
        );
        assert!(alice.vault.store().get("assemblies/x.txt").is_some());
        assert_eq!(alice.vault.reconcile().await.still_held, 1);
    }

    #[tokio::test]
    async fn test_folder_rename_blocked_by_other_checkout() {
        let (backend, alice) = seeded().await;
        let bob = vault_for(&backend, "bob");
        bob.vault.refresh().await.unwrap();
        bob.vault.download(&p("parts/x.txt")).await.unwrap();
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        bob.vault.refresh().await.unwrap();

        assert_eq!(
            bob.vault.rename("parts", "assemblies").await,
            Err(VaultError::AlreadyLocked {
                holder: "alice".into()
            })
        );
        assert!(bob.disk.stat("parts/x.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_server_delete_requires_plan() {
        let (backend, alice) = seeded().await;
        let bob = vault_for(&backend, "bob");
        bob.vault.refresh().await.unwrap();
        bob.vault.download(&p("parts/x.txt")).await.unwrap();
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        bob.vault.refresh().await.unwrap();

        let plan = bob.vault.plan_server_delete(&p("parts/x.txt"));
        assert!(plan.is_empty());
        assert_eq!(plan.blocked, vec![("parts/x.txt".to_string(), Blocked::LockedBy("alice".into()))]);

        alice.vault.undo_checkout(&p("parts/x.txt")).await.unwrap();
        bob.vault.refresh().await.unwrap();
        let plan = bob.vault.plan_server_delete(&p("parts"));
        assert_eq!(plan.files.len(), 1);

        let outcome = bob.vault.delete_from_server(plan).await.unwrap();
        assert!(outcome.is_complete_success());
        assert!(backend.list_files("vault-1").await.unwrap().is_empty());
        assert!(bob.disk.stat("parts/x.txt").await.unwrap().is_none());
        assert!(bob.vault.store().get("parts/x.txt").is_none());
    }

    #[tokio::test]
    async fn test_repair_read_only_drift() {
        let (_backend, alice) = seeded().await;
        alice.disk.set_read_only("parts/x.txt", false).await.unwrap();

        let report = alice.vault.repair_read_only().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.corrected, vec!["parts/x.txt"]);
        assert!(alice.disk.is_read_only("parts/x.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_repair_adopts_server_lock() {
        let (_backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();
        alice.vault.store().forget(&file_id);

        let report = alice.vault.repair_read_only().await.unwrap();
        assert_eq!(report.adopted, vec!["parts/x.txt"]);
        assert!(report.corrected.is_empty());
        assert!(alice.vault.store().believed_lock(&file_id).is_some());
    }

    #[tokio::test]
    async fn test_remote_update_detects_orphan() {
        let (backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();
        let forced = backend
            .force_checkin(&file_id, "admin", CheckinRequest::default())
            .await
            .unwrap();

        let orphan = alice.vault.handle_remote_update(forced.clone()).await;
        assert!(orphan.is_some());
        assert!(alice.vault.handle_remote_update(forced).await.is_none());
        assert_eq!(alice.vault.orphans().len(), 1);

        alice.vault.dismiss_orphan(&file_id).unwrap();
        assert!(alice.vault.orphans().is_empty());
        let toasts = alice.notifier.toasts.lock().unwrap().clone();
        assert_eq!(
            toasts.last().unwrap(),
            &(vaultsync_core::ToastKind::Info, "Dismissed orphaned checkout of x.txt".to_string())
        );
    }

    #[tokio::test]
    async fn test_own_checkin_echo_is_not_orphan() {
        let (backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();

        // The server has committed alice's checkin; the realtime echo arrives
        // before her own call returns
        let echo = backend
            .checkin(&file_id, "alice", CheckinRequest::default())
            .await
            .unwrap();
        assert_eq!(echo.version, 2);

        assert!(alice.vault.handle_remote_update(echo).await.is_none());
        assert!(alice.vault.orphans().is_empty());
        assert!(alice.vault.store().believed_lock(&file_id).is_none());
        assert!(!alice
            .notifier
            .messages()
            .iter()
            .any(|m| m.contains("while you had it checked out")));
    }

    #[tokio::test]
    async fn test_reconcile_waits_for_checkin_on_same_path() {
        let (backend, alice) = seeded().await;
        alice.vault.checkout_file("parts/x.txt").await.unwrap();
        let file_id = alice.vault.store().get("parts/x.txt").unwrap().file_id().unwrap().to_string();

        let held = p("parts/x.txt");
        let checkin = alice
            .vault
            .queue()
            .run(OperationKind::Checkin, "Check in parts/x.txt", &held, || async {
                backend.checkin(&file_id, "alice", CheckinRequest::default()).await?;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                alice.vault.store().forget(&file_id);
                Ok::<_, VaultError>(())
            });
        let reconcile = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            alice.vault.reconcile().await
        };
        let (checked_in, report) = tokio::join!(checkin, reconcile);
        checked_in.unwrap();

        // The lock was gone by the time the path was free
        assert_eq!(report.checked, 1);
        assert_eq!(report.released, 0);
        assert!(report.orphaned.is_empty());
        assert!(alice.vault.orphans().is_empty());
    }

    /// Disk whose next `stat` reports a hash the content no longer has, as
    /// when an autosave lands between hashing and reading.
    struct AutosaveDisk {
        inner: Arc<LocalDisk>,
        stale_hash: std::sync::Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl LocalFileSystem for AutosaveDisk {
        async fn scan(&self) -> Result<Vec<vaultsync_core::LocalEntry>, VaultError> {
            self.inner.scan().await
        }
        async fn stat(&self, relative_path: &str) -> Result<Option<vaultsync_core::LocalEntry>, VaultError> {
            let mut entry = self.inner.stat(relative_path).await?;
            if let (Some(entry), Some(stale)) = (entry.as_mut(), self.stale_hash.lock().unwrap().take()) {
                entry.content_hash = Some(stale);
            }
            Ok(entry)
        }
        async fn read(&self, relative_path: &str) -> Result<Vec<u8>, VaultError> {
            self.inner.read(relative_path).await
        }
        async fn write(&self, relative_path: &str, data: &[u8]) -> Result<(), VaultError> {
            self.inner.write(relative_path, data).await
        }
        async fn delete(&self, relative_path: &str) -> Result<bool, VaultError> {
            self.inner.delete(relative_path).await
        }
        async fn rename(&self, from: &str, to: &str) -> Result<(), VaultError> {
            self.inner.rename(from, to).await
        }
        async fn copy(&self, from: &str, to: &str) -> Result<(), VaultError> {
            self.inner.copy(from, to).await
        }
        async fn create_dir(&self, relative_path: &str) -> Result<(), VaultError> {
            self.inner.create_dir(relative_path).await
        }
        async fn set_read_only(&self, relative_path: &str, read_only: bool) -> Result<(), VaultError> {
            self.inner.set_read_only(relative_path, read_only).await
        }
        async fn is_read_only(&self, relative_path: &str) -> Result<bool, VaultError> {
            self.inner.is_read_only(relative_path).await
        }
    }

    #[tokio::test]
    async fn test_checkin_uploads_bytes_matching_published_hash() {
        let (backend, alice) = seeded().await;
        let disk = Arc::new(AutosaveDisk {
            inner: alice.disk.clone(),
            stale_hash: std::sync::Mutex::new(None),
        });
        let vault = Vault::new(
            backend.clone(),
            disk.clone(),
            Arc::new(vaultsync_core::SilentNotifier),
            VaultOptions {
                vault_id: "vault-1".into(),
                org_id: "org-1".into(),
                user_id: "alice".into(),
                ignore: IgnoreRules::empty(),
            },
        );
        vault.refresh().await.unwrap();
        vault.checkout_file("parts/x.txt").await.unwrap();

        disk.write("parts/x.txt", b"autosaved").await.unwrap();
        *disk.stale_hash.lock().unwrap() = Some(content_hash(b"edited"));

        let updated = vault.checkin_file("parts/x.txt", None).await.unwrap();
        let published = updated.content_hash.unwrap();
        assert_eq!(published, content_hash(b"autosaved"));
        let blob = backend.get_blob(&published).await.unwrap();
        assert_eq!(blob, b"autosaved");
        assert_eq!(updated.size, 9);
    }
}
