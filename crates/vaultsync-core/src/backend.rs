use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::record::ServerRecord;
use crate::serial::SerializationSettings;

/// Result of a conditional checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// The lock was free and is now ours.
    Acquired(ServerRecord),
    /// We already held it; nothing changed.
    AlreadyHeld(ServerRecord),
    /// Someone else holds it.
    LockedBy { holder: String },
}

/// Changes published by a checkin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinRequest {
    /// Hash of content already uploaded with [`VaultBackend::put_blob`]
    pub new_content_hash: Option<String>,
    pub new_file_size: Option<u64>,
    pub new_file_path: Option<String>,
    pub new_file_name: Option<String>,
    pub comment: Option<String>,
}

/// A file's first upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub path: String,
    pub name: String,
    pub content_hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Checkout,
    Checkin,
    UndoCheckout,
    ForceCheckin,
    Create,
    Delete,
    Rename,
}

/// Audit trail entry written server-side for every lock change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub user_id: String,
    pub action: ActivityAction,
    pub file_id: String,
    pub file_path: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub details: Option<String>,
}

impl ActivityRecord {
    pub fn new(user_id: &str, action: ActivityAction, record: &ServerRecord) -> Self {
        Self {
            user_id: user_id.to_string(),
            action,
            file_id: record.id.clone(),
            file_path: record.path.clone(),
            at: Utc::now(),
            details: None,
        }
    }
}

/// The remote catalog, blob store, lock and counter primitives.
///
/// Two methods carry the cross-client correctness guarantees and must each be
/// one atomic unit on the server, never a read followed by a write:
/// - [`try_checkout`](Self::try_checkout): set `checked_out_by` only if null.
/// - [`allocate_serial`](Self::allocate_serial): read, skip keepouts,
///   increment and store the counter.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file", "rest").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// List live (not deleted) files of a vault.
    async fn list_files(&self, vault_id: &str) -> Result<Vec<ServerRecord>, VaultError>;

    async fn get_file(&self, file_id: &str) -> Result<Option<ServerRecord>, VaultError>;

    /// Create the server record for a file's first version. The blob must
    /// already be stored.
    async fn create_file(
        &self,
        vault_id: &str,
        user_id: &str,
        file: NewFile,
    ) -> Result<ServerRecord, VaultError>;

    /// Soft-delete a file. Fails with `AlreadyLocked` if another user holds it.
    async fn delete_file(&self, file_id: &str, user_id: &str) -> Result<(), VaultError>;

    // =========================================================================
    // Locks
    // =========================================================================

    /// Atomic conditional checkout.
    async fn try_checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<CheckoutOutcome, VaultError>;

    /// Publish a new version and clear the lock. Fails with `NotOwner` unless
    /// `user_id` holds the lock, in which case nothing changes.
    async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError>;

    /// Clear the caller's lock without a new version. `NotOwner` otherwise.
    async fn release(&self, file_id: &str, user_id: &str) -> Result<ServerRecord, VaultError>;

    /// Administrative checkin of whatever lock is held, bumping the version.
    /// This is the remote action that leaves the former holder orphaned.
    async fn force_checkin(
        &self,
        file_id: &str,
        admin_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError>;

    // =========================================================================
    // Content
    // =========================================================================

    /// Store content under its hash. Storing an existing hash is a no-op.
    async fn put_blob(&self, content_hash: &str, data: &[u8]) -> Result<(), VaultError>;

    async fn get_blob(&self, content_hash: &str) -> Result<Vec<u8>, VaultError>;

    // =========================================================================
    // Activity
    // =========================================================================

    async fn record_activity(&self, activity: ActivityRecord) -> Result<(), VaultError>;

    // =========================================================================
    // Serialization
    // =========================================================================

    async fn load_serialization_settings(
        &self,
        org_id: &str,
    ) -> Result<SerializationSettings, VaultError>;

    /// Save presentation settings. Never writes `current_counter`, whatever
    /// value the caller's copy holds.
    async fn save_serialization_settings(
        &self,
        org_id: &str,
        settings: &SerializationSettings,
    ) -> Result<(), VaultError>;

    /// Atomically allocate the next number. `None` when serialization is
    /// disabled for the organization.
    async fn allocate_serial(&self, org_id: &str) -> Result<Option<u64>, VaultError>;

    /// Administrative counter reset, e.g. after importing numbered files.
    /// `expected` guards against clobbering a concurrent allocation: the
    /// write fails with `StaleCounter` if the counter moved.
    async fn set_serial_counter(
        &self,
        org_id: &str,
        expected: u64,
        value: u64,
    ) -> Result<(), VaultError>;
}
