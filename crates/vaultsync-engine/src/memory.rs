use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};
use vaultsync_core::serial::next_available;
use vaultsync_core::{
    ActivityRecord, CheckinRequest, CheckoutOutcome, NewFile, SerializationSettings,
    ServerRecord, VaultBackend, VaultError,
};

#[derive(Debug, Clone)]
struct StoredFile {
    record: ServerRecord,
    deleted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, StoredFile>,
    blobs: HashMap<String, Vec<u8>>,
    activity: Vec<ActivityRecord>,
    serialization: HashMap<String, SerializationSettings>,
    next_id: u64,
    /// (operation, file_id) pairs that fail with a network error
    failures: HashSet<(String, String)>,
}

impl MemoryState {
    fn check_failure(&self, op: &str, file_id: &str) -> Result<(), VaultError> {
        if self.failures.contains(&(op.to_string(), file_id.to_string())) {
            return Err(VaultError::Network(format!("{} {} unreachable", op, file_id)));
        }
        Ok(())
    }

    fn live_file(&mut self, file_id: &str) -> Result<&mut ServerRecord, VaultError> {
        match self.files.get_mut(file_id) {
            Some(stored) if !stored.deleted => Ok(&mut stored.record),
            _ => Err(VaultError::NotFound(format!("File {}", file_id))),
        }
    }

    fn apply_content(&self, record: &mut ServerRecord, request: &CheckinRequest) -> Result<(), VaultError> {
        if let Some(hash) = &request.new_content_hash {
            if !self.blobs.contains_key(hash) {
                return Err(VaultError::InvalidArgument(format!(
                    "Content {} was not uploaded",
                    hash
                )));
            }
            record.content_hash = Some(hash.clone());
        }
        if let Some(size) = request.new_file_size {
            record.size = size;
        }
        if let Some(path) = &request.new_file_path {
            record.path = vaultsync_core::paths::normalize(path);
        }
        if let Some(name) = &request.new_file_name {
            record.name = name.clone();
        }
        Ok(())
    }
}

/// In-process server.
///
/// One mutex guards the whole catalog, so each trait method is a single
/// atomic unit, which is what the conditional checkout and the counter
/// increment require. Failures can be injected per operation and file to
/// simulate an unreachable server.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, VaultError> {
        self.state
            .lock()
            .map_err(|_| VaultError::Internal("Memory backend state poisoned".to_string()))
    }

    /// Make `op` (a trait method name such as `"try_checkout"`) fail with a
    /// network error for `file_id` until cleared.
    pub fn inject_failure(&self, op: &str, file_id: &str) {
        if let Ok(mut state) = self.state() {
            state.failures.insert((op.to_string(), file_id.to_string()));
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state() {
            state.failures.clear();
        }
    }

    /// Audit records written so far, oldest first.
    pub fn activity(&self) -> Vec<ActivityRecord> {
        self.state().map(|s| s.activity.clone()).unwrap_or_default()
    }

    /// Seed an organization's settings, counter included.
    pub fn set_serialization_settings(&self, org_id: &str, settings: SerializationSettings) {
        if let Ok(mut state) = self.state() {
            state.serialization.insert(org_id.to_string(), settings);
        }
    }
}

#[async_trait]
impl VaultBackend for MemoryBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn list_files(&self, vault_id: &str) -> Result<Vec<ServerRecord>, VaultError> {
        let state = self.state()?;
        let mut files: Vec<ServerRecord> = state
            .files
            .values()
            .filter(|f| !f.deleted && f.record.vault_id == vault_id)
            .map(|f| f.record.clone())
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn get_file(&self, file_id: &str) -> Result<Option<ServerRecord>, VaultError> {
        let state = self.state()?;
        state.check_failure("get_file", file_id)?;
        Ok(state
            .files
            .get(file_id)
            .filter(|f| !f.deleted)
            .map(|f| f.record.clone()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_file(
        &self,
        vault_id: &str,
        user_id: &str,
        file: NewFile,
    ) -> Result<ServerRecord, VaultError> {
        let mut state = self.state()?;
        let path = vaultsync_core::paths::normalize(&file.path);
        if state
            .files
            .values()
            .any(|f| !f.deleted && f.record.vault_id == vault_id && f.record.path == path)
        {
            return Err(VaultError::InvalidArgument(format!("{} already exists", path)));
        }
        if !state.blobs.contains_key(&file.content_hash) {
            return Err(VaultError::InvalidArgument(format!(
                "Content {} was not uploaded",
                file.content_hash
            )));
        }

        state.next_id += 1;
        let id = format!("file-{}", state.next_id);
        let record = ServerRecord {
            id: id.clone(),
            vault_id: vault_id.to_string(),
            path,
            name: file.name,
            content_hash: Some(file.content_hash),
            size: file.size,
            version: 1,
            checked_out_by: None,
            checked_out_at: None,
            updated_by: Some(user_id.to_string()),
            updated_at: Utc::now(),
        };
        state.files.insert(
            id,
            StoredFile {
                record: record.clone(),
                deleted: false,
            },
        );
        debug!("Created {} at {}", record.id, record.path);
        Ok(record)
    }

    async fn delete_file(&self, file_id: &str, user_id: &str) -> Result<(), VaultError> {
        let mut state = self.state()?;
        state.check_failure("delete_file", file_id)?;
        let record = state.live_file(file_id)?;
        if let Some(holder) = &record.checked_out_by {
            if holder != user_id {
                return Err(VaultError::AlreadyLocked {
                    holder: holder.clone(),
                });
            }
        }
        if let Some(stored) = state.files.get_mut(file_id) {
            stored.deleted = true;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<CheckoutOutcome, VaultError> {
        let mut state = self.state()?;
        state.check_failure("try_checkout", file_id)?;
        let record = state.live_file(file_id)?;
        match record.checked_out_by.clone() {
            Some(holder) if holder == user_id => Ok(CheckoutOutcome::AlreadyHeld(record.clone())),
            Some(holder) => Ok(CheckoutOutcome::LockedBy { holder }),
            None => {
                record.checked_out_by = Some(user_id.to_string());
                record.checked_out_at = Some(Utc::now());
                Ok(CheckoutOutcome::Acquired(record.clone()))
            }
        }
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError> {
        let mut state = self.state()?;
        state.check_failure("checkin", file_id)?;
        let mut record = state.live_file(file_id)?.clone();
        if !record.is_checked_out_by(user_id) {
            return Err(VaultError::NotOwner(record.path.clone()));
        }
        state.apply_content(&mut record, &request)?;
        record.checked_out_by = None;
        record.checked_out_at = None;
        record.version += 1;
        record.updated_by = Some(user_id.to_string());
        record.updated_at = Utc::now();
        *state.live_file(file_id)? = record.clone();
        Ok(record)
    }

    async fn release(&self, file_id: &str, user_id: &str) -> Result<ServerRecord, VaultError> {
        let mut state = self.state()?;
        state.check_failure("release", file_id)?;
        let record = state.live_file(file_id)?;
        if !record.is_checked_out_by(user_id) {
            return Err(VaultError::NotOwner(record.path.clone()));
        }
        record.checked_out_by = None;
        record.checked_out_at = None;
        Ok(record.clone())
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn force_checkin(
        &self,
        file_id: &str,
        admin_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError> {
        let mut state = self.state()?;
        let mut record = state.live_file(file_id)?.clone();
        state.apply_content(&mut record, &request)?;
        record.checked_out_by = None;
        record.checked_out_at = None;
        record.version += 1;
        record.updated_by = Some(admin_id.to_string());
        record.updated_at = Utc::now();
        *state.live_file(file_id)? = record.clone();
        Ok(record)
    }

    async fn put_blob(&self, content_hash: &str, data: &[u8]) -> Result<(), VaultError> {
        let mut state = self.state()?;
        state
            .blobs
            .entry(content_hash.to_string())
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get_blob(&self, content_hash: &str) -> Result<Vec<u8>, VaultError> {
        let state = self.state()?;
        state
            .blobs
            .get(content_hash)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("Blob {}", content_hash)))
    }

    async fn record_activity(&self, activity: ActivityRecord) -> Result<(), VaultError> {
        let mut state = self.state()?;
        state.check_failure("record_activity", &activity.file_id)?;
        state.activity.push(activity);
        Ok(())
    }

    async fn load_serialization_settings(
        &self,
        org_id: &str,
    ) -> Result<SerializationSettings, VaultError> {
        let state = self.state()?;
        Ok(state.serialization.get(org_id).cloned().unwrap_or_default())
    }

    async fn save_serialization_settings(
        &self,
        org_id: &str,
        settings: &SerializationSettings,
    ) -> Result<(), VaultError> {
        settings.validate()?;
        let mut state = self.state()?;
        let stored = state.serialization.entry(org_id.to_string()).or_default();
        let counter = stored.current_counter;
        *stored = settings.clone();
        stored.current_counter = counter;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn allocate_serial(&self, org_id: &str) -> Result<Option<u64>, VaultError> {
        let mut state = self.state()?;
        let settings = state.serialization.entry(org_id.to_string()).or_default();
        if !settings.enabled {
            return Ok(None);
        }
        let next = next_available(settings.current_counter, &settings.keepout_zones)?;
        settings.current_counter = next;
        Ok(Some(next))
    }

    async fn set_serial_counter(
        &self,
        org_id: &str,
        expected: u64,
        value: u64,
    ) -> Result<(), VaultError> {
        let mut state = self.state()?;
        let settings = state.serialization.entry(org_id.to_string()).or_default();
        if settings.current_counter != expected {
            return Err(VaultError::StaleCounter(format!(
                "Counter is {} (expected {})",
                settings.current_counter, expected
            )));
        }
        settings.current_counter = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    async fn seed(backend: &MemoryBackend) -> ServerRecord {
        backend.put_blob("h1", b"v1").await.unwrap();
        backend
            .create_file(
                "vault-1",
                "alice",
                NewFile {
                    path: "a.txt".into(),
                    name: "a.txt".into(),
                    content_hash: "h1".into(),
                    size: 2,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_checkout_checkin_round_trip() {
        let backend = MemoryBackend::new();
        let file = seed(&backend).await;

        let outcome = backend.try_checkout(&file.id, "alice").await.unwrap();
        assert!(matches!(outcome, CheckoutOutcome::Acquired(_)));
        let again = backend.try_checkout(&file.id, "alice").await.unwrap();
        assert!(matches!(again, CheckoutOutcome::AlreadyHeld(_)));

        backend.put_blob("h2", b"v2").await.unwrap();
        let record = backend
            .checkin(
                &file.id,
                "alice",
                CheckinRequest {
                    new_content_hash: Some("h2".into()),
                    new_file_size: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(record.checked_out_by, None);
        assert_eq!(record.version, 2);
        assert_eq!(record.content_hash.as_deref(), Some("h2"));
    }

    #[tokio::test]
    async fn test_checkin_by_non_owner_changes_nothing() {
        let backend = MemoryBackend::new();
        let file = seed(&backend).await;
        backend.try_checkout(&file.id, "alice").await.unwrap();

        let err = backend
            .checkin(&file.id, "bob", CheckinRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotOwner(_)));

        let record = backend.get_file(&file.id).await.unwrap().unwrap();
        assert_eq!(record.checked_out_by.as_deref(), Some("alice"));
        assert_eq!(record.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checkout_single_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let file = seed(&backend).await;

        const NUM_TASKS: usize = 8;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let mut handles = vec![];
        for i in 0..NUM_TASKS {
            let backend = Arc::clone(&backend);
            let barrier = Arc::clone(&barrier);
            let file_id = file.id.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                backend
                    .try_checkout(&file_id, &format!("user-{}", i))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                CheckoutOutcome::Acquired(_) => winners += 1,
                CheckoutOutcome::LockedBy { .. } => {}
                CheckoutOutcome::AlreadyHeld(_) => panic!("distinct users cannot already hold"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_safe_settings_save_keeps_counter() {
        let backend = MemoryBackend::new();
        backend.set_serialization_settings(
            "org",
            SerializationSettings {
                enabled: true,
                ..Default::default()
            },
        );
        let stale = backend.load_serialization_settings("org").await.unwrap();
        assert_eq!(backend.allocate_serial("org").await.unwrap(), Some(1));
        assert_eq!(backend.allocate_serial("org").await.unwrap(), Some(2));

        // Saving a copy loaded before the allocations must not rewind the counter
        let mut edited = stale.clone();
        edited.prefix = "PN-".into();
        backend.save_serialization_settings("org", &edited).await.unwrap();

        let current = backend.load_serialization_settings("org").await.unwrap();
        assert_eq!(current.prefix, "PN-");
        assert_eq!(current.current_counter, 2);

        assert!(matches!(
            backend.set_serial_counter("org", 0, 50).await,
            Err(VaultError::StaleCounter(_))
        ));
        backend.set_serial_counter("org", 2, 50).await.unwrap();
        assert_eq!(backend.allocate_serial("org").await.unwrap(), Some(51));
    }

    #[tokio::test]
    async fn test_disabled_serialization() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.allocate_serial("org").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = MemoryBackend::new();
        let file = seed(&backend).await;
        backend.inject_failure("try_checkout", &file.id);
        assert!(matches!(
            backend.try_checkout(&file.id, "alice").await,
            Err(VaultError::Network(_))
        ));
        backend.clear_failures();
        assert!(backend.try_checkout(&file.id, "alice").await.is_ok());
    }
}
