use std::sync::Arc;

use tracing::{debug, info, instrument};
use vaultsync_core::serial::{detect_highest, next_available};
use vaultsync_core::{SerializationSettings, VaultBackend, VaultError};

/// Serial number issuance for one organization.
///
/// Allocation is delegated to the backend's atomic increment; nothing here
/// reads the counter and writes it back.
#[derive(Clone)]
pub struct SerialCounter {
    backend: Arc<dyn VaultBackend>,
    org_id: String,
}

impl SerialCounter {
    pub fn new(backend: Arc<dyn VaultBackend>, org_id: impl Into<String>) -> Self {
        Self {
            backend,
            org_id: org_id.into(),
        }
    }

    pub async fn settings(&self) -> Result<SerializationSettings, VaultError> {
        self.backend.load_serialization_settings(&self.org_id).await
    }

    /// The identifier the next allocation would produce, without reserving
    /// it. Another client may take it first.
    pub async fn preview_next(&self, tab: Option<u32>) -> Result<Option<String>, VaultError> {
        let settings = self.settings().await?;
        if !settings.enabled {
            return Ok(None);
        }
        let next = next_available(settings.current_counter, &settings.keepout_zones)?;
        settings.format(next, tab).map(Some)
    }

    /// Reserve and format the next identifier. `None` when serialization is
    /// disabled.
    #[instrument(skip(self), level = "debug")]
    pub async fn allocate_next(&self, tab: Option<u32>) -> Result<Option<String>, VaultError> {
        let settings = self.settings().await?;
        if !settings.enabled {
            return Ok(None);
        }
        // Reject a bad tab before a number is burned
        settings.format(0, tab)?;

        let Some(value) = self.backend.allocate_serial(&self.org_id).await? else {
            return Ok(None);
        };
        let formatted = settings.format(value, tab)?;
        debug!("Allocated serial {} for {}", formatted, self.org_id);
        Ok(Some(formatted))
    }

    /// Allocate only if `file_name` has an auto-numbered extension.
    pub async fn allocate_for(&self, file_name: &str, tab: Option<u32>) -> Result<Option<String>, VaultError> {
        let settings = self.settings().await?;
        if !settings.enabled || !settings.applies_to(file_name) {
            return Ok(None);
        }
        self.allocate_next(tab).await
    }

    /// Save presentation settings; the stored counter is left as is.
    pub async fn save_settings(&self, settings: &SerializationSettings) -> Result<(), VaultError> {
        settings.validate()?;
        self.backend
            .save_serialization_settings(&self.org_id, settings)
            .await
    }

    /// Highest number in use among `names`. Advisory; apply it with
    /// [`set_counter`](Self::set_counter).
    pub async fn detect_highest<'a, I>(&self, names: I) -> Result<Option<u64>, VaultError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let settings = self.settings().await?;
        detect_highest(&settings, names)
    }

    /// Administrative counter reset. Fails with `StaleCounter` if another
    /// client allocated in between.
    pub async fn set_counter(&self, value: u64) -> Result<(), VaultError> {
        let current = self.settings().await?.current_counter;
        self.backend
            .set_serial_counter(&self.org_id, current, value)
            .await?;
        info!("Serial counter for {} set {} -> {}", self.org_id, current, value);
        Ok(())
    }
}
