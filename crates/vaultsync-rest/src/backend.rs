use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};
use vaultsync_core::{
    ActivityRecord, CheckinRequest, CheckoutOutcome, NewFile, SerializationSettings, ServerRecord,
    VaultBackend, VaultError,
};

use crate::client::{eq, RestClient, RestConfig};
use crate::rows::{
    ActivityRow, CheckinArgs, CheckoutPatch, FileRow, FileUserArgs, NewFileRow, OrgArgs,
    SaveSettingsArgs, SetCounterArgs, SettingsRow,
};

/// Conditional PATCH attempts before giving up on a lock that keeps
/// flipping between holders.
const CHECKOUT_ATTEMPTS: usize = 3;

/// [`VaultBackend`] over PostgREST tables, database functions and object
/// storage.
///
/// Checkout is a filtered PATCH (`checked_out_by=is.null`), so the database
/// applies it atomically. Checkin, release, forced checkin, soft delete,
/// serial allocation and the settings save are database functions.
pub struct RestBackend {
    client: RestClient,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Self {
        Self {
            client: RestClient::new(config),
        }
    }

    async fn fetch(&self, file_id: &str) -> Result<Option<ServerRecord>, VaultError> {
        let query = format!("id={}&deleted_at=is.null&select=*", eq(file_id));
        let rows: Vec<FileRow> = self.client.select("files", &query).await?;
        Ok(rows.into_iter().next().map(ServerRecord::from))
    }

    fn single(rows: Vec<FileRow>, context: &str) -> Result<ServerRecord, VaultError> {
        rows.into_iter()
            .next()
            .map(ServerRecord::from)
            .ok_or_else(|| VaultError::Serialization(format!("{} returned no row", context)))
    }
}

#[async_trait]
impl VaultBackend for RestBackend {
    fn backend_name(&self) -> &'static str {
        "rest"
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_files(&self, vault_id: &str) -> Result<Vec<ServerRecord>, VaultError> {
        let query = format!(
            "vault_id={}&deleted_at=is.null&order=file_path.asc&select=*",
            eq(vault_id)
        );
        let rows: Vec<FileRow> = self.client.select("files", &query).await?;
        debug!("Listed {} files in vault {}", rows.len(), vault_id);
        Ok(rows.into_iter().map(ServerRecord::from).collect())
    }

    async fn get_file(&self, file_id: &str) -> Result<Option<ServerRecord>, VaultError> {
        self.fetch(file_id).await
    }

    #[instrument(skip(self, file), level = "debug", fields(path = %file.path))]
    async fn create_file(
        &self,
        vault_id: &str,
        user_id: &str,
        file: NewFile,
    ) -> Result<ServerRecord, VaultError> {
        let row = NewFileRow::new(vault_id, user_id, &file);
        let rows: Vec<FileRow> = match self.client.insert("files", &row).await {
            // Unique violation on (vault_id, file_path)
            Err(VaultError::AlreadyLocked { .. }) => {
                return Err(VaultError::InvalidArgument(format!(
                    "{} already exists",
                    file.path
                )));
            }
            other => other?,
        };
        Self::single(rows, "files insert")
    }

    async fn delete_file(&self, file_id: &str, user_id: &str) -> Result<(), VaultError> {
        let args = FileUserArgs {
            p_file_id: file_id,
            p_user_id: user_id,
        };
        self.client.rpc_void("soft_delete_file", &args).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<CheckoutOutcome, VaultError> {
        let query = format!(
            "id={}&checked_out_by=is.null&deleted_at=is.null",
            eq(file_id)
        );
        for attempt in 1..=CHECKOUT_ATTEMPTS {
            let patch = CheckoutPatch {
                checked_out_by: user_id,
                checked_out_at: Utc::now(),
            };
            let updated: Vec<FileRow> = self.client.update("files", &query, &patch).await?;
            if let Some(row) = updated.into_iter().next() {
                return Ok(CheckoutOutcome::Acquired(row.into()));
            }

            // The filter matched nothing: someone holds it, or the file is gone
            let current = self
                .fetch(file_id)
                .await?
                .ok_or_else(|| VaultError::NotFound(format!("File {}", file_id)))?;
            match current.checked_out_by.clone() {
                Some(holder) if holder == user_id => return Ok(CheckoutOutcome::AlreadyHeld(current)),
                Some(holder) => return Ok(CheckoutOutcome::LockedBy { holder }),
                None => debug!("Lock on {} released mid-checkout, attempt {}", file_id, attempt),
            }
        }
        warn!("Giving up on contended checkout of {}", file_id);
        Err(VaultError::Network(format!(
            "Checkout of {} kept racing other clients",
            file_id
        )))
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError> {
        let args = CheckinArgs::new(file_id, user_id, &request);
        let row: FileRow = self.client.rpc("checkin_file", &args).await?;
        Ok(row.into())
    }

    async fn release(&self, file_id: &str, user_id: &str) -> Result<ServerRecord, VaultError> {
        let args = FileUserArgs {
            p_file_id: file_id,
            p_user_id: user_id,
        };
        let row: FileRow = self.client.rpc("release_checkout", &args).await?;
        Ok(row.into())
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn force_checkin(
        &self,
        file_id: &str,
        admin_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError> {
        let args = CheckinArgs::new(file_id, admin_id, &request);
        let row: FileRow = self.client.rpc("admin_force_checkin", &args).await?;
        Ok(row.into())
    }

    async fn put_blob(&self, content_hash: &str, data: &[u8]) -> Result<(), VaultError> {
        self.client.upload_object(content_hash, data).await
    }

    async fn get_blob(&self, content_hash: &str) -> Result<Vec<u8>, VaultError> {
        self.client.download_object(content_hash).await
    }

    async fn record_activity(&self, activity: ActivityRecord) -> Result<(), VaultError> {
        self.client
            .insert_minimal("activity", &ActivityRow::from(&activity))
            .await
    }

    async fn load_serialization_settings(
        &self,
        org_id: &str,
    ) -> Result<SerializationSettings, VaultError> {
        let query = format!("org_id={}&select=settings", eq(org_id));
        let rows: Vec<SettingsRow> = self.client.select("serialization_settings", &query).await?;
        Ok(rows
            .into_iter()
            .next()
            .map(|row| row.settings)
            .unwrap_or_default())
    }

    async fn save_serialization_settings(
        &self,
        org_id: &str,
        settings: &SerializationSettings,
    ) -> Result<(), VaultError> {
        settings.validate()?;
        let args = SaveSettingsArgs {
            p_org_id: org_id,
            p_settings: settings,
        };
        self.client
            .rpc_void("update_serialization_settings_safe", &args)
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn allocate_serial(&self, org_id: &str) -> Result<Option<u64>, VaultError> {
        self.client
            .rpc("get_next_serial_number", &OrgArgs { p_org_id: org_id })
            .await
    }

    async fn set_serial_counter(
        &self,
        org_id: &str,
        expected: u64,
        value: u64,
    ) -> Result<(), VaultError> {
        let args = SetCounterArgs {
            p_org_id: org_id,
            p_expected: expected,
            p_value: value,
        };
        let applied: bool = self.client.rpc("set_serial_counter", &args).await?;
        if applied {
            Ok(())
        } else {
            Err(VaultError::StaleCounter(format!(
                "Counter for {} is no longer {}",
                org_id, expected
            )))
        }
    }
}
