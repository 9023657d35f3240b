//! Checkout lock manager.
//!
//! The conditional update on the server is the only cross-client mutual
//! exclusion. After it commits, the local read-only bit and the audit entry
//! follow as separate best-effort steps.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use vaultsync_core::rules;
use vaultsync_core::{
    paths, ActivityAction, BelievedLock, CheckinRequest, CheckoutOutcome, ServerRecord,
    VaultError,
};

use crate::batch::{run_batch, BatchOutcome};
use crate::context::VaultContext;
use crate::disk::content_hash;

/// How a checkout call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkout {
    Acquired,
    /// The caller already held the lock; nothing changed.
    AlreadyHeld,
}

#[derive(Clone)]
pub struct CheckoutManager {
    ctx: Arc<VaultContext>,
}

impl CheckoutManager {
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self { ctx }
    }

    fn believe(&self, relative_path: &str, server: &ServerRecord) {
        self.ctx.store.believe(BelievedLock {
            file_id: server.id.clone(),
            relative_path: paths::normalize(relative_path),
            version: server.version,
            acquired_at: server.checked_out_at.unwrap_or_else(Utc::now),
        });
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn checkout(&self, relative_path: &str) -> Result<Checkout, VaultError> {
        let record = self.ctx.record(relative_path)?;
        rules::can_checkout(&record, &self.ctx.user_id).map_err(|b| b.into_error(relative_path))?;
        let file_id = record
            .file_id()
            .ok_or_else(|| VaultError::NotFound(format!("{} has no server record", relative_path)))?;

        match self.ctx.backend.try_checkout(file_id, &self.ctx.user_id).await? {
            CheckoutOutcome::Acquired(server) => {
                self.believe(&record.relative_path, &server);
                self.ctx.store.upsert_server(server.clone());
                if record.local.is_some() {
                    self.ctx.mirror_read_only(&record.relative_path, false).await;
                    self.ctx.refresh_local(&record.relative_path).await?;
                }
                self.ctx.audit(ActivityAction::Checkout, &server, None).await;
                info!("Checked out {}", record.relative_path);
                Ok(Checkout::Acquired)
            }
            CheckoutOutcome::AlreadyHeld(server) => {
                if self.ctx.store.believed_lock(&server.id).is_none() {
                    self.believe(&record.relative_path, &server);
                }
                self.ctx.store.upsert_server(server);
                debug!("{} is already checked out by us", record.relative_path);
                Ok(Checkout::AlreadyHeld)
            }
            CheckoutOutcome::LockedBy { holder } => {
                // Our copy was stale; show the real holder
                match self.ctx.backend.get_file(file_id).await {
                    Ok(Some(server)) => self.ctx.store.upsert_server(server),
                    Ok(None) => {}
                    Err(e) => warn!("Failed to refresh {}: {}", record.relative_path, e),
                }
                Err(VaultError::AlreadyLocked { holder })
            }
        }
    }

    /// Publish the local copy as a new version and release the lock.
    ///
    /// Content is uploaded only when its hash changed; a local rename since
    /// the last publish is sent as a path/name change.
    #[instrument(skip(self, comment), level = "debug")]
    pub async fn checkin(
        &self,
        relative_path: &str,
        comment: Option<String>,
    ) -> Result<ServerRecord, VaultError> {
        let record = self.ctx.record(relative_path)?;
        rules::can_checkin(&record, &self.ctx.user_id).map_err(|b| b.into_error(relative_path))?;
        let server = record
            .server
            .as_ref()
            .ok_or_else(|| VaultError::NotFound(format!("{} has no server record", relative_path)))?;

        // Hash the bytes that get uploaded; the file may change under us
        let data = self.ctx.fs.read(&record.relative_path).await?;
        let local_hash = content_hash(&data);

        let mut request = CheckinRequest {
            comment,
            ..Default::default()
        };
        if server.content_hash.as_deref() != Some(local_hash.as_str()) {
            self.ctx.backend.put_blob(&local_hash, &data).await?;
            request.new_content_hash = Some(local_hash);
            request.new_file_size = Some(data.len() as u64);
        }
        if paths::normalize(&server.path) != record.relative_path {
            request.new_file_path = Some(record.relative_path.clone());
            let name = paths::file_name(&record.relative_path);
            if name != server.name {
                request.new_file_name = Some(name.to_string());
            }
        }

        let updated = self
            .ctx
            .backend
            .checkin(&server.id, &self.ctx.user_id, request)
            .await?;

        self.ctx.mirror_read_only(&record.relative_path, true).await;
        self.ctx.store.forget(&updated.id);
        self.ctx.store.set_baseline(
            &record.relative_path,
            vaultsync_core::SyncBaseline::from_server(&updated),
        );
        self.ctx.store.upsert_server(updated.clone());
        self.ctx.refresh_local(&record.relative_path).await?;
        self.ctx.audit(ActivityAction::Checkin, &updated, None).await;
        info!("Checked in {} as v{}", record.relative_path, updated.version);
        Ok(updated)
    }

    /// Release the lock without publishing; local edits stay on disk.
    #[instrument(skip(self), level = "debug")]
    pub async fn undo_checkout(&self, relative_path: &str) -> Result<ServerRecord, VaultError> {
        let record = self.ctx.record(relative_path)?;
        rules::can_undo_checkout(&record, &self.ctx.user_id)
            .map_err(|b| b.into_error(relative_path))?;
        let file_id = record
            .file_id()
            .ok_or_else(|| VaultError::NotFound(format!("{} has no server record", relative_path)))?;

        let updated = self.ctx.backend.release(file_id, &self.ctx.user_id).await?;
        if record.local.is_some() {
            self.ctx.mirror_read_only(&record.relative_path, true).await;
        }
        self.ctx.store.forget(&updated.id);
        self.ctx.store.upsert_server(updated.clone());
        if record.local.is_some() {
            self.ctx.refresh_local(&record.relative_path).await?;
        }
        self.ctx.audit(ActivityAction::UndoCheckout, &updated, None).await;
        info!("Undid checkout of {}", record.relative_path);
        Ok(updated)
    }

    /// Administrative checkin of whoever holds the lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn force_checkin(&self, relative_path: &str) -> Result<ServerRecord, VaultError> {
        let record = self.ctx.record(relative_path)?;
        let server = record
            .server
            .as_ref()
            .ok_or_else(|| VaultError::NotFound(format!("{} has no server record", relative_path)))?;
        let previous = server.checked_out_by.clone();

        let updated = self
            .ctx
            .backend
            .force_checkin(&server.id, &self.ctx.user_id, CheckinRequest::default())
            .await?;
        self.ctx.store.forget(&updated.id);
        self.ctx.store.upsert_server(updated.clone());
        if record.local.is_some() {
            self.ctx.mirror_read_only(&record.relative_path, true).await;
        }
        self.ctx
            .audit(
                ActivityAction::ForceCheckin,
                &updated,
                previous.map(|holder| format!("Released checkout held by {}", holder)),
            )
            .await;
        info!("Force checked in {} as v{}", record.relative_path, updated.version);
        Ok(updated)
    }

    pub async fn checkout_many(&self, relative_paths: Vec<String>) -> BatchOutcome {
        run_batch(
            self.ctx.notifier.as_ref(),
            "Checked out",
            relative_paths,
            |p| p.clone(),
            |p| async move { self.checkout(&p).await.map(|_| ()) },
        )
        .await
    }

    pub async fn checkin_many(&self, relative_paths: Vec<String>, comment: Option<String>) -> BatchOutcome {
        run_batch(
            self.ctx.notifier.as_ref(),
            "Checked in",
            relative_paths,
            |p| p.clone(),
            |p| {
                let comment = comment.clone();
                async move { self.checkin(&p, comment).await.map(|_| ()) }
            },
        )
        .await
    }

    pub async fn undo_checkout_many(&self, relative_paths: Vec<String>) -> BatchOutcome {
        run_batch(
            self.ctx.notifier.as_ref(),
            "Undid checkout of",
            relative_paths,
            |p| p.clone(),
            |p| async move { self.undo_checkout(&p).await.map(|_| ()) },
        )
        .await
    }
}
