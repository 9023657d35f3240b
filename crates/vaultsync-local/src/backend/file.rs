use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;
use vaultsync_core::paths;
use vaultsync_core::serial::next_available;
use vaultsync_core::{
    ActivityRecord, CheckinRequest, CheckoutOutcome, NewFile, SerializationSettings,
    ServerRecord, VaultBackend, VaultError,
};

const CATALOG_FILE: &str = "catalog.json";
const LOCK_FILE: &str = "catalog.lock";
const ACTIVITY_FILE: &str = "activity.jsonl";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFile {
    record: ServerRecord,
    #[serde(default)]
    deleted: bool,
}

/// On-disk catalog: `{dir}/catalog.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    #[serde(default)]
    files: BTreeMap<String, StoredFile>,
    #[serde(default)]
    serialization: BTreeMap<String, SerializationSettings>,
    #[serde(default)]
    next_id: u64,
}

impl Catalog {
    fn live_file(&mut self, file_id: &str) -> Result<&mut ServerRecord, VaultError> {
        match self.files.get_mut(file_id) {
            Some(stored) if !stored.deleted => Ok(&mut stored.record),
            _ => Err(VaultError::NotFound(format!("File {}", file_id))),
        }
    }

    /// Publish a new version, clearing whatever lock is held.
    fn publish(
        &mut self,
        file_id: &str,
        user_id: &str,
        request: &CheckinRequest,
        blobs: &Path,
    ) -> Result<ServerRecord, VaultError> {
        let record = self.live_file(file_id)?;
        if let Some(hash) = &request.new_content_hash {
            if !blobs.join(blob_key(hash)?).exists() {
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
            record.path = paths::normalize(path);
        }
        if let Some(name) = &request.new_file_name {
            record.name = name.clone();
        }
        record.checked_out_by = None;
        record.checked_out_at = None;
        record.version += 1;
        record.updated_by = Some(user_id.to_string());
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

/// Content hashes double as blob file names, so only accept plain hex-ish keys.
fn blob_key(content_hash: &str) -> Result<&str, VaultError> {
    if content_hash.is_empty() || !content_hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(VaultError::InvalidArgument(format!(
            "Invalid content hash {:?}",
            content_hash
        )));
    }
    Ok(content_hash)
}

/// Holds an OS-level lock on `catalog.lock` until dropped.
struct CatalogLock {
    file: File,
}

impl CatalogLock {
    fn acquire(dir: &Path, exclusive: bool) -> Result<Self, VaultError> {
        std::fs::create_dir_all(dir.join(BLOBS_DIR)).map_err(|e| {
            VaultError::Io(format!("Failed to create catalog dir {}: {}", dir.display(), e))
        })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))
            .map_err(|e| VaultError::Io(format!("Failed to open lock file: {}", e)))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|e| VaultError::Io(format!("Failed to lock catalog: {}", e)))?;
        Ok(Self { file })
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn read_catalog(dir: &Path) -> Result<Catalog, VaultError> {
    let path = dir.join(CATALOG_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Catalog::default()),
        Err(e) => Err(VaultError::Io(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Write through a temp file and rename so readers never see a torn catalog.
/// Write through a temp file and rename. The temp name is unique per call,
/// since blob writers do not hold the catalog lock.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), VaultError> {
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let written = File::create(&temp_path)
        .and_then(|mut file| file.write_all(data).and_then(|_| file.sync_all()))
        .map_err(|e| VaultError::Io(format!("Failed to write {}: {}", temp_path.display(), e)))
        .and_then(|_| {
            std::fs::rename(&temp_path, path).map_err(|e| {
                VaultError::Io(format!(
                    "Failed to rename temp file to {}: {}",
                    path.display(),
                    e
                ))
            })
        });
    if written.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    written
}

/// [`VaultBackend`] over a directory shared by every client, e.g. a network
/// drive.
///
/// Layout under the catalog directory:
/// - `catalog.json`: file records and per-organization serialization settings
/// - `catalog.lock`: OS lock file (flock on Unix, LockFile on Windows)
/// - `blobs/{hash}`: content, written once per hash
/// - `activity.jsonl`: append-only audit trail
///
/// Every mutation holds an exclusive lock on `catalog.lock` across re-read,
/// mutate and write, which makes the conditional checkout and the counter
/// increment atomic across processes. A crashed client releases its lock
/// when the OS closes the descriptor.
#[derive(Debug, Clone)]
pub struct FileCatalogBackend {
    dir: PathBuf,
}

impl FileCatalogBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Run `f` on the catalog under the OS lock, on the blocking pool.
    /// `write` takes the lock exclusively and persists the catalog after `f`
    /// succeeds; otherwise the lock is shared and nothing is written.
    async fn with_catalog<T, F>(&self, write: bool, f: F) -> Result<T, VaultError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Catalog, &Path) -> Result<T, VaultError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = CatalogLock::acquire(&dir, write)?;
            let mut catalog = read_catalog(&dir)?;
            let result = f(&mut catalog, &dir.join(BLOBS_DIR))?;
            if write {
                let data = serde_json::to_vec_pretty(&catalog)?;
                write_atomic(&dir.join(CATALOG_FILE), &data)?;
            }
            Ok(result)
        })
        .await
        .map_err(|e| VaultError::Internal(format!("Catalog task failed: {}", e)))?
    }
}

#[async_trait]
impl VaultBackend for FileCatalogBackend {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_files(&self, vault_id: &str) -> Result<Vec<ServerRecord>, VaultError> {
        let vault_id = vault_id.to_string();
        self.with_catalog(false, move |catalog, _| {
            let mut files: Vec<ServerRecord> = catalog
                .files
                .values()
                .filter(|f| !f.deleted && f.record.vault_id == vault_id)
                .map(|f| f.record.clone())
                .collect();
            files.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(files)
        })
        .await
    }

    async fn get_file(&self, file_id: &str) -> Result<Option<ServerRecord>, VaultError> {
        let file_id = file_id.to_string();
        self.with_catalog(false, move |catalog, _| {
            Ok(catalog
                .files
                .get(&file_id)
                .filter(|f| !f.deleted)
                .map(|f| f.record.clone()))
        })
        .await
    }

    #[instrument(skip(self, file), level = "debug", fields(path = %file.path))]
    async fn create_file(
        &self,
        vault_id: &str,
        user_id: &str,
        file: NewFile,
    ) -> Result<ServerRecord, VaultError> {
        let vault_id = vault_id.to_string();
        let user_id = user_id.to_string();
        let record = self
            .with_catalog(true, move |catalog, blobs| {
                let path = paths::normalize(&file.path);
                if catalog
                    .files
                    .values()
                    .any(|f| !f.deleted && f.record.vault_id == vault_id && f.record.path == path)
                {
                    return Err(VaultError::InvalidArgument(format!("{} already exists", path)));
                }
                if !blobs.join(blob_key(&file.content_hash)?).exists() {
                    return Err(VaultError::InvalidArgument(format!(
                        "Content {} was not uploaded",
                        file.content_hash
                    )));
                }

                catalog.next_id += 1;
                let record = ServerRecord {
                    id: format!("file-{}", catalog.next_id),
                    vault_id,
                    path,
                    name: file.name,
                    content_hash: Some(file.content_hash),
                    size: file.size,
                    version: 1,
                    checked_out_by: None,
                    checked_out_at: None,
                    updated_by: Some(user_id),
                    updated_at: Utc::now(),
                };
                catalog.files.insert(
                    record.id.clone(),
                    StoredFile {
                        record: record.clone(),
                        deleted: false,
                    },
                );
                Ok(record)
            })
            .await?;
        debug!("Created {} at {}", record.id, record.path);
        Ok(record)
    }

    async fn delete_file(&self, file_id: &str, user_id: &str) -> Result<(), VaultError> {
        let file_id = file_id.to_string();
        let user_id = user_id.to_string();
        self.with_catalog(true, move |catalog, _| {
            let record = catalog.live_file(&file_id)?;
            if let Some(holder) = &record.checked_out_by {
                if *holder != user_id {
                    return Err(VaultError::AlreadyLocked {
                        holder: holder.clone(),
                    });
                }
            }
            if let Some(stored) = catalog.files.get_mut(&file_id) {
                stored.deleted = true;
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_checkout(
        &self,
        file_id: &str,
        user_id: &str,
    ) -> Result<CheckoutOutcome, VaultError> {
        let file_id = file_id.to_string();
        let user_id = user_id.to_string();
        self.with_catalog(true, move |catalog, _| {
            let record = catalog.live_file(&file_id)?;
            match record.checked_out_by.clone() {
                Some(holder) if holder == user_id => {
                    Ok(CheckoutOutcome::AlreadyHeld(record.clone()))
                }
                Some(holder) => Ok(CheckoutOutcome::LockedBy { holder }),
                None => {
                    record.checked_out_by = Some(user_id);
                    record.checked_out_at = Some(Utc::now());
                    Ok(CheckoutOutcome::Acquired(record.clone()))
                }
            }
        })
        .await
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn checkin(
        &self,
        file_id: &str,
        user_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError> {
        let file_id = file_id.to_string();
        let user_id = user_id.to_string();
        self.with_catalog(true, move |catalog, blobs| {
            let record = catalog.live_file(&file_id)?;
            if !record.is_checked_out_by(&user_id) {
                return Err(VaultError::NotOwner(record.path.clone()));
            }
            catalog.publish(&file_id, &user_id, &request, blobs)
        })
        .await
    }

    async fn release(&self, file_id: &str, user_id: &str) -> Result<ServerRecord, VaultError> {
        let file_id = file_id.to_string();
        let user_id = user_id.to_string();
        self.with_catalog(true, move |catalog, _| {
            let record = catalog.live_file(&file_id)?;
            if !record.is_checked_out_by(&user_id) {
                return Err(VaultError::NotOwner(record.path.clone()));
            }
            record.checked_out_by = None;
            record.checked_out_at = None;
            Ok(record.clone())
        })
        .await
    }

    #[instrument(skip(self, request), level = "debug")]
    async fn force_checkin(
        &self,
        file_id: &str,
        admin_id: &str,
        request: CheckinRequest,
    ) -> Result<ServerRecord, VaultError> {
        let file_id = file_id.to_string();
        let admin_id = admin_id.to_string();
        self.with_catalog(true, move |catalog, blobs| {
            catalog.publish(&file_id, &admin_id, &request, blobs)
        })
        .await
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn put_blob(&self, content_hash: &str, data: &[u8]) -> Result<(), VaultError> {
        let path = self.dir.join(BLOBS_DIR).join(blob_key(content_hash)?);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        let data = data.to_vec();
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(dir.join(BLOBS_DIR)).map_err(|e| {
                VaultError::Io(format!("Failed to create blobs dir: {}", e))
            })?;
            write_atomic(&path, &data)
        })
        .await
        .map_err(|e| VaultError::Internal(format!("Blob task failed: {}", e)))?
    }

    async fn get_blob(&self, content_hash: &str) -> Result<Vec<u8>, VaultError> {
        let path = self.dir.join(BLOBS_DIR).join(blob_key(content_hash)?);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(format!("Blob {}", content_hash))
            } else {
                VaultError::Io(format!("Failed to read blob {}: {}", content_hash, e))
            }
        })
    }

    async fn record_activity(&self, activity: ActivityRecord) -> Result<(), VaultError> {
        let mut line = serde_json::to_vec(&activity)?;
        line.push(b'\n');
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = CatalogLock::acquire(&dir, true)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(ACTIVITY_FILE))
                .map_err(|e| VaultError::Io(format!("Failed to open activity log: {}", e)))?;
            file.write_all(&line)
                .map_err(|e| VaultError::Io(format!("Failed to append activity: {}", e)))
        })
        .await
        .map_err(|e| VaultError::Internal(format!("Activity task failed: {}", e)))?
    }

    async fn load_serialization_settings(
        &self,
        org_id: &str,
    ) -> Result<SerializationSettings, VaultError> {
        let org_id = org_id.to_string();
        self.with_catalog(false, move |catalog, _| {
            Ok(catalog
                .serialization
                .get(&org_id)
                .cloned()
                .unwrap_or_default())
        })
        .await
    }

    async fn save_serialization_settings(
        &self,
        org_id: &str,
        settings: &SerializationSettings,
    ) -> Result<(), VaultError> {
        settings.validate()?;
        let org_id = org_id.to_string();
        let settings = settings.clone();
        self.with_catalog(true, move |catalog, _| {
            let stored = catalog.serialization.entry(org_id).or_default();
            let counter = stored.current_counter;
            *stored = settings;
            stored.current_counter = counter;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn allocate_serial(&self, org_id: &str) -> Result<Option<u64>, VaultError> {
        let org_id = org_id.to_string();
        self.with_catalog(true, move |catalog, _| {
            let settings = catalog.serialization.entry(org_id).or_default();
            if !settings.enabled {
                return Ok(None);
            }
            let next = next_available(settings.current_counter, &settings.keepout_zones)?;
            settings.current_counter = next;
            Ok(Some(next))
        })
        .await
    }

    async fn set_serial_counter(
        &self,
        org_id: &str,
        expected: u64,
        value: u64,
    ) -> Result<(), VaultError> {
        let org_id = org_id.to_string();
        self.with_catalog(true, move |catalog, _| {
            let settings = catalog.serialization.entry(org_id).or_default();
            if settings.current_counter != expected {
                return Err(VaultError::StaleCounter(format!(
                    "Counter is {} (expected {})",
                    settings.current_counter, expected
                )));
            }
            settings.current_counter = value;
            Ok(())
        })
        .await
    }
}
