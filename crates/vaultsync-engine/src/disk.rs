use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument};
use vaultsync_core::{paths, LocalEntry, LocalFileSystem, VaultError};

/// Compute the hex SHA-256 of `data`, the content hash used everywhere.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Local disk rooted at a vault directory.
///
/// Top-level names in `excluded` (the client's own state directory, for
/// instance) are invisible to `scan`.
#[derive(Debug, Clone)]
pub struct LocalDisk {
    root: PathBuf,
    excluded: Vec<String>,
}

impl LocalDisk {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            excluded: vec![".vaultsync".to_string()],
        }
    }

    pub fn with_excluded(mut self, name: impl Into<String>) -> Self {
        self.excluded.push(name.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a vault-relative path onto disk, refusing anything that escapes
    /// the root.
    fn resolve(&self, relative_path: &str) -> Result<PathBuf, VaultError> {
        let normalized = paths::normalize(relative_path);
        let rel = Path::new(&normalized);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(VaultError::InvalidArgument(format!(
                "Path escapes the vault: {}",
                relative_path
            )));
        }
        Ok(self.root.join(rel))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(paths::normalize(&rel.to_string_lossy()))
    }

    async fn entry_for(&self, relative_path: &str, path: &Path) -> Result<Option<LocalEntry>, VaultError> {
        let metadata = match fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VaultError::Io(format!(
                    "Failed to get metadata for {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        let read_only = metadata.permissions().readonly();

        if metadata.is_dir() {
            return Ok(Some(LocalEntry {
                relative_path: relative_path.to_string(),
                is_directory: true,
                content_hash: None,
                size: 0,
                modified_at,
                read_only,
            }));
        }

        let content = fs::read(path).await.map_err(|e| {
            VaultError::Io(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        Ok(Some(LocalEntry {
            relative_path: relative_path.to_string(),
            is_directory: false,
            content_hash: Some(content_hash(&content)),
            size: metadata.len(),
            modified_at,
            read_only,
        }))
    }

    async fn ensure_parent(&self, path: &Path) -> Result<(), VaultError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                VaultError::Io(format!(
                    "Failed to create parent directory for {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    async fn set_permissions(path: &Path, read_only: bool) -> Result<(), VaultError> {
        let metadata = fs::metadata(path).await.map_err(|e| {
            VaultError::Io(format!("Failed to get metadata for {}: {}", path.display(), e))
        })?;
        let mut permissions = metadata.permissions();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = permissions.mode();
            let mode = if read_only { mode & !0o222 } else { mode | 0o200 };
            permissions.set_mode(mode);
        }
        #[cfg(not(unix))]
        {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(read_only);
        }

        fs::set_permissions(path, permissions).await.map_err(|e| {
            VaultError::Io(format!(
                "Failed to set read-only={} on {}: {}",
                read_only,
                path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl LocalFileSystem for LocalDisk {
    #[instrument(skip(self), level = "debug")]
    async fn scan(&self) -> Result<Vec<LocalEntry>, VaultError> {
        let mut entries = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut read_dir = fs::read_dir(&dir).await.map_err(|e| {
                VaultError::Io(format!("Failed to read directory {}: {}", dir.display(), e))
            })?;

            while let Some(item) = read_dir.next_entry().await.map_err(|e| {
                VaultError::Io(format!("Failed to read directory {}: {}", dir.display(), e))
            })? {
                let path = item.path();
                let Some(relative) = self.relative(&path) else {
                    continue;
                };
                if dir == self.root && self.excluded.iter().any(|name| *name == relative) {
                    continue;
                }
                // Skip half-written downloads
                if relative.ends_with(".vaultsync.tmp") {
                    continue;
                }
                if let Some(entry) = self.entry_for(&relative, &path).await? {
                    if entry.is_directory {
                        stack.push(path);
                    }
                    entries.push(entry);
                }
            }
        }

        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        debug!("Scanned {} entries under {}", entries.len(), self.root.display());
        Ok(entries)
    }

    #[instrument(skip(self), level = "debug")]
    async fn stat(&self, relative_path: &str) -> Result<Option<LocalEntry>, VaultError> {
        let path = self.resolve(relative_path)?;
        self.entry_for(&paths::normalize(relative_path), &path).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(&self, relative_path: &str) -> Result<Vec<u8>, VaultError> {
        let path = self.resolve(relative_path)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(format!("{}", path.display())))
            }
            Err(e) => Err(VaultError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&self, relative_path: &str, data: &[u8]) -> Result<(), VaultError> {
        let path = self.resolve(relative_path)?;
        self.ensure_parent(&path).await?;

        // Write atomically via temp file
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.vaultsync.tmp", file_name));
        fs::write(&temp_path, data).await.map_err(|e| {
            VaultError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;

        // Replacing a read-only file fails on some platforms
        if fs::try_exists(&path).await.unwrap_or(false) {
            Self::set_permissions(&path, false).await?;
        }
        fs::rename(&temp_path, &path).await.map_err(|e| {
            VaultError::Io(format!("Failed to rename to {}: {}", path.display(), e))
        })?;

        debug!("Wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, relative_path: &str) -> Result<bool, VaultError> {
        let path = self.resolve(relative_path)?;
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(VaultError::Io(format!(
                    "Failed to get metadata for {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let result = if metadata.is_dir() {
            fs::remove_dir(&path).await
        } else {
            if metadata.permissions().readonly() {
                Self::set_permissions(&path, false).await?;
            }
            fs::remove_file(&path).await
        };
        result.map_err(|e| {
            VaultError::Io(format!("Failed to delete {}: {}", path.display(), e))
        })?;

        debug!("Deleted {}", path.display());
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn rename(&self, from: &str, to: &str) -> Result<(), VaultError> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        if fs::try_exists(&to_path).await.unwrap_or(false) {
            return Err(VaultError::InvalidArgument(format!(
                "{} already exists",
                to_path.display()
            )));
        }
        self.ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path).await.map_err(|e| {
            VaultError::Io(format!(
                "Failed to rename {} to {}: {}",
                from_path.display(),
                to_path.display(),
                e
            ))
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy(&self, from: &str, to: &str) -> Result<(), VaultError> {
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        self.ensure_parent(&to_path).await?;
        fs::copy(&from_path, &to_path).await.map_err(|e| {
            VaultError::Io(format!(
                "Failed to copy {} to {}: {}",
                from_path.display(),
                to_path.display(),
                e
            ))
        })?;
        // The copy inherits the source's read-only bit; a backup stays editable
        Self::set_permissions(&to_path, false).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_dir(&self, relative_path: &str) -> Result<(), VaultError> {
        let path = self.resolve(relative_path)?;
        fs::create_dir_all(&path).await.map_err(|e| {
            VaultError::Io(format!("Failed to create directory {}: {}", path.display(), e))
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_read_only(&self, relative_path: &str, read_only: bool) -> Result<(), VaultError> {
        let path = self.resolve(relative_path)?;
        Self::set_permissions(&path, read_only).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_read_only(&self, relative_path: &str) -> Result<bool, VaultError> {
        let path = self.resolve(relative_path)?;
        let metadata = fs::metadata(&path).await.map_err(|e| {
            VaultError::Io(format!("Failed to get metadata for {}: {}", path.display(), e))
        })?;
        Ok(metadata.permissions().readonly())
    }
}
