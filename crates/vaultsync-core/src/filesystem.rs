use async_trait::async_trait;

use crate::error::VaultError;
use crate::record::LocalEntry;

/// Desktop-shell filesystem operations, rooted at a vault directory.
///
/// Every path is vault-relative. Failures come back as `VaultError::Io`
/// (or `NotFound`) rather than panicking.
#[async_trait]
pub trait LocalFileSystem: Send + Sync {
    /// Walk the vault and return every entry with content hashes.
    async fn scan(&self) -> Result<Vec<LocalEntry>, VaultError>;

    /// Stat and hash one entry; `None` if it does not exist.
    async fn stat(&self, relative_path: &str) -> Result<Option<LocalEntry>, VaultError>;

    async fn read(&self, relative_path: &str) -> Result<Vec<u8>, VaultError>;

    /// Write a file, creating parent directories. Replaces an existing file
    /// even if it is read-only.
    async fn write(&self, relative_path: &str, data: &[u8]) -> Result<(), VaultError>;

    /// Delete a file or empty directory. Returns false if it did not exist.
    async fn delete(&self, relative_path: &str) -> Result<bool, VaultError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), VaultError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), VaultError>;

    async fn create_dir(&self, relative_path: &str) -> Result<(), VaultError>;

    async fn set_read_only(&self, relative_path: &str, read_only: bool) -> Result<(), VaultError>;

    async fn is_read_only(&self, relative_path: &str) -> Result<bool, VaultError>;
}
