use std::sync::Arc;

use tracing::{debug, warn};
use vaultsync_core::{
    ActivityAction, ActivityRecord, FileRecord, LocalEntry, LocalFileSystem, Notifier,
    ServerRecord, SyncBaseline, VaultBackend, VaultError,
};

use crate::disk::content_hash;
use crate::queue::OperationQueue;
use crate::store::FileStore;

/// Collaborators and state shared by every engine component of one vault.
pub struct VaultContext {
    pub backend: Arc<dyn VaultBackend>,
    pub fs: Arc<dyn LocalFileSystem>,
    pub notifier: Arc<dyn Notifier>,
    pub store: FileStore,
    pub queue: OperationQueue,
    pub user_id: String,
    pub vault_id: String,
    pub org_id: String,
}

impl VaultContext {
    pub fn record(&self, relative_path: &str) -> Result<FileRecord, VaultError> {
        self.store
            .get(relative_path)
            .ok_or_else(|| VaultError::NotFound(format!("No file at {}", relative_path)))
    }

    /// Re-stat one path and fold the result into the store.
    pub async fn refresh_local(&self, relative_path: &str) -> Result<Option<LocalEntry>, VaultError> {
        let entry = self.fs.stat(relative_path).await?;
        match &entry {
            Some(entry) => self.store.upsert_local(entry.clone()),
            None => self.store.remove_local(relative_path),
        }
        Ok(entry)
    }

    /// Toggle the read-only bit, logging instead of failing.
    ///
    /// The server-side lock change this mirrors is already committed and is
    /// not rolled back; the repair pass fixes any drift left behind.
    pub async fn mirror_read_only(&self, relative_path: &str, read_only: bool) -> bool {
        match self.fs.set_read_only(relative_path, read_only).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Failed to set read-only={} on {}: {}",
                    read_only, relative_path, e
                );
                false
            }
        }
    }

    /// Write an audit entry; failures are logged and swallowed.
    pub async fn audit(&self, action: ActivityAction, record: &ServerRecord, details: Option<String>) {
        let mut activity = ActivityRecord::new(&self.user_id, action, record);
        activity.details = details;
        if let Err(e) = self.backend.record_activity(activity).await {
            warn!("Failed to record {:?} activity for {}: {}", action, record.path, e);
        }
    }

    /// Download `server`'s current content to `local_path`, then update the
    /// read-only bit, the baseline and the store.
    pub async fn pull(&self, server: &ServerRecord, local_path: &str) -> Result<LocalEntry, VaultError> {
        let hash = server
            .content_hash
            .as_deref()
            .ok_or_else(|| VaultError::NotFound(format!("{} has no content", server.path)))?;
        let data = self.backend.get_blob(hash).await?;
        let actual = content_hash(&data);
        if actual != hash {
            return Err(VaultError::Io(format!(
                "Downloaded content for {} hashes to {}, expected {}",
                server.path, actual, hash
            )));
        }

        self.fs.write(local_path, &data).await?;
        self.mirror_read_only(local_path, !server.is_checked_out_by(&self.user_id))
            .await;
        self.store
            .set_baseline(local_path, SyncBaseline::from_server(server));
        self.store.upsert_server(server.clone());
        debug!("Pulled {} v{} to {}", server.path, server.version, local_path);

        self.refresh_local(local_path)
            .await?
            .ok_or_else(|| VaultError::Io(format!("{} vanished after download", local_path)))
    }
}
