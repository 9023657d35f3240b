use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff;

/// Derived relationship between a file's local and server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    /// Synced: same content at the same path.
    None,
    /// Local only, never uploaded.
    Added,
    /// Edited locally since the last pull.
    Modified,
    /// Removed locally after having been pulled; still on the server.
    Deleted,
    /// Same content as a server record at a different path.
    Moved,
    /// The server has a newer version and the local copy is unedited.
    Outdated,
    /// Server only, never pulled.
    Cloud,
    /// Local only and matched by an ignore pattern.
    Ignored,
}

impl DiffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffStatus::None => "none",
            DiffStatus::Added => "added",
            DiffStatus::Modified => "modified",
            DiffStatus::Deleted => "deleted",
            DiffStatus::Moved => "moved",
            DiffStatus::Outdated => "outdated",
            DiffStatus::Cloud => "cloud",
            DiffStatus::Ignored => "ignored",
        }
    }

    /// Whether a local copy is expected to exist for this status.
    pub fn has_local(&self) -> bool {
        !matches!(self, DiffStatus::Cloud | DiffStatus::Deleted)
    }
}

impl std::fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A filesystem entry under the vault root, as read from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// Vault-relative, forward-slash normalized
    pub relative_path: String,
    pub is_directory: bool,
    /// SHA-256 of the content, hex encoded. `None` for directories or when
    /// hashing has not completed.
    pub content_hash: Option<String>,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub read_only: bool,
}

impl LocalEntry {
    /// Shorthand for a hashed regular file.
    pub fn file(relative_path: impl Into<String>, content_hash: impl Into<String>, size: u64) -> Self {
        Self {
            relative_path: crate::paths::normalize(&relative_path.into()),
            is_directory: false,
            content_hash: Some(content_hash.into()),
            size,
            modified_at: None,
            read_only: false,
        }
    }

    pub fn directory(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: crate::paths::normalize(&relative_path.into()),
            is_directory: true,
            content_hash: None,
            size: 0,
            modified_at: None,
            read_only: false,
        }
    }
}

/// The server-side catalog row for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub vault_id: String,
    /// Vault-relative path of the file as last published
    pub path: String,
    pub name: String,
    pub content_hash: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub version: u32,
    /// Lock owner; at most one at a time, enforced by the backend
    #[serde(default)]
    pub checked_out_by: Option<String>,
    #[serde(default)]
    pub checked_out_at: Option<DateTime<Utc>>,
    /// Who published the current version
    #[serde(default)]
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    pub fn lock_state(&self, user_id: &str) -> LockState {
        match &self.checked_out_by {
            None => LockState::Unlocked,
            Some(holder) if holder == user_id => LockState::LockedByMe,
            Some(holder) => LockState::LockedByOther(holder.clone()),
        }
    }

    pub fn is_checked_out_by(&self, user_id: &str) -> bool {
        self.checked_out_by.as_deref() == Some(user_id)
    }
}

/// Lock ownership as seen by one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockedByMe,
    LockedByOther(String),
}

/// What the client last pulled or pushed for a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBaseline {
    pub content_hash: String,
    pub version: u32,
}

impl SyncBaseline {
    pub fn from_server(record: &ServerRecord) -> Option<Self> {
        record.content_hash.as_ref().map(|hash| Self {
            content_hash: hash.clone(),
            version: record.version,
        })
    }
}

/// One filesystem entry under the vault root paired with its server record.
///
/// `diff_status` is derived from the other fields and recomputed by every
/// constructor and mutator; it is never set on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub relative_path: String,
    pub is_directory: bool,
    pub local: Option<LocalEntry>,
    pub server: Option<ServerRecord>,
    pub baseline: Option<SyncBaseline>,
    diff_status: DiffStatus,
}

impl FileRecord {
    /// Build a record, returning `None` when both sides are absent.
    pub fn new(
        relative_path: &str,
        local: Option<LocalEntry>,
        server: Option<ServerRecord>,
        baseline: Option<SyncBaseline>,
        ignored: bool,
    ) -> Option<Self> {
        let relative_path = crate::paths::normalize(relative_path);
        let diff_status = diff::classify(
            &relative_path,
            local.as_ref(),
            server.as_ref(),
            baseline.as_ref(),
            ignored,
        )?;
        let is_directory = local.as_ref().map(|l| l.is_directory).unwrap_or(false);
        Some(Self {
            relative_path,
            is_directory,
            local,
            server,
            baseline,
            diff_status,
        })
    }

    pub fn diff_status(&self) -> DiffStatus {
        self.diff_status
    }

    pub fn local_hash(&self) -> Option<&str> {
        self.local.as_ref().and_then(|l| l.content_hash.as_deref())
    }

    pub fn file_id(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.id.as_str())
    }

    pub fn lock_state(&self, user_id: &str) -> LockState {
        self.server
            .as_ref()
            .map(|s| s.lock_state(user_id))
            .unwrap_or(LockState::Unlocked)
    }

    /// Read-only bit the local copy should carry for `user_id`.
    ///
    /// Only files checked out by the user are writable; files that were never
    /// uploaded are always writable.
    pub fn expected_read_only(&self, user_id: &str) -> bool {
        match &self.server {
            None => false,
            Some(server) => !server.is_checked_out_by(user_id),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::server;
    use super::*;

    #[test]
    fn test_record_requires_one_side() {
        assert!(FileRecord::new("a.txt", None, None, None, false).is_none());
    }

    #[test]
    fn test_expected_read_only() {
        let mut srv = server("f1", "a.txt", "h1", 1);
        let record = FileRecord::new(
            "a.txt",
            Some(LocalEntry::file("a.txt", "h1", 10)),
            Some(srv.clone()),
            None,
            false,
        )
        .unwrap();
        assert!(record.expected_read_only("alice"));

        srv.checked_out_by = Some("alice".into());
        let record = FileRecord::new("a.txt", record.local.clone(), Some(srv), None, false).unwrap();
        assert!(!record.expected_read_only("alice"));
        assert!(record.expected_read_only("bob"));
        assert_eq!(record.lock_state("bob"), LockState::LockedByOther("alice".into()));

        let added = FileRecord::new("b.txt", Some(LocalEntry::file("b.txt", "h", 1)), None, None, false)
            .unwrap();
        assert!(!added.expected_read_only("alice"));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&DiffStatus::Outdated).unwrap();
        assert_eq!(json, "\"outdated\"");
        assert!(!DiffStatus::Cloud.has_local());
        assert!(DiffStatus::Moved.has_local());
    }
}
