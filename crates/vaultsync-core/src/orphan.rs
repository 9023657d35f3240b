use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::ServerRecord;

/// A lock this client believes it holds, as last confirmed by the server.
///
/// Kept apart from the server's `checked_out_by` so that a remote change is
/// noticed by comparison instead of silently overwriting the belief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BelievedLock {
    pub file_id: String,
    pub relative_path: String,
    /// Server version when the lock was acquired
    pub version: u32,
    pub acquired_at: DateTime<Utc>,
}

/// A held lock invalidated by another client's forced checkin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedCheckout {
    pub file_id: String,
    /// Server-side path of the file
    pub file_path: String,
    pub file_name: String,
    pub checked_in_by: Option<String>,
    pub checked_in_at: DateTime<Utc>,
    pub new_version: u32,
    /// Where the local copy lives, vault-relative
    pub local_path: String,
    /// Set when a resolution attempt failed; the record stays open.
    #[serde(default)]
    pub last_error: Option<String>,
}

/// The four ways to reconcile an orphaned checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Delete the local file and download the server copy.
    Discard,
    /// Take the lock again, keeping local content.
    ReCheckout,
    /// Copy the local file to a timestamped sibling, then discard.
    BackupThenDiscard,
    /// Take the lock and check in local content as a new version.
    UploadAsNew,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Discard => "discard",
            ResolutionAction::ReCheckout => "re-checkout",
            ResolutionAction::BackupThenDiscard => "backup-then-discard",
            ResolutionAction::UploadAsNew => "upload-as-new",
        }
    }

    /// Past-tense verb for summary messages.
    pub fn verb(&self) -> &'static str {
        match self {
            ResolutionAction::Discard => "Discarded",
            ResolutionAction::ReCheckout => "Re-checked out",
            ResolutionAction::BackupThenDiscard => "Backed up and discarded",
            ResolutionAction::UploadAsNew => "Uploaded",
        }
    }
}

impl std::str::FromStr for ResolutionAction {
    type Err = crate::VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" => Ok(ResolutionAction::Discard),
            "re-checkout" | "recheckout" => Ok(ResolutionAction::ReCheckout),
            "backup-then-discard" | "backup" => Ok(ResolutionAction::BackupThenDiscard),
            "upload-as-new" | "upload" => Ok(ResolutionAction::UploadAsNew),
            other => Err(crate::VaultError::InvalidArgument(format!(
                "Unknown resolution action: {}",
                other
            ))),
        }
    }
}

/// Outcome of comparing a believed lock against fresh server state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCheck {
    /// The server still shows the lock as ours.
    StillHeld,
    /// Lock gone and the version advanced: a remote checkin happened.
    Orphaned(OrphanedCheckout),
    /// Lock gone without a new version, or the new version is our own
    /// checkin; nothing to merge.
    Released,
    /// The server no longer has the file.
    Missing,
}

/// Compare one believed lock with the server's current record.
pub fn check_lock(believed: &BelievedLock, server: Option<&ServerRecord>, user_id: &str) -> LockCheck {
    let Some(server) = server else {
        return LockCheck::Missing;
    };
    if server.is_checked_out_by(user_id) {
        return LockCheck::StillHeld;
    }
    let own_checkin = server.updated_by.as_deref() == Some(user_id);
    if server.version > believed.version && !own_checkin {
        LockCheck::Orphaned(OrphanedCheckout {
            file_id: server.id.clone(),
            file_path: server.path.clone(),
            file_name: server.name.clone(),
            checked_in_by: server.updated_by.clone(),
            checked_in_at: server.updated_at,
            new_version: server.version,
            local_path: believed.relative_path.clone(),
            last_error: None,
        })
    } else {
        LockCheck::Released
    }
}

/// Sibling path for a backup copy: `dir/name.backup-YYYYMMDD-HHMMSS.ext`.
pub fn backup_path(relative_path: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d-%H%M%S");
    let parent = crate::paths::parent(relative_path);
    let name = crate::paths::file_name(relative_path);
    let backup_name = match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}.backup-{}{}", &name[..idx], stamp, &name[idx..]),
        _ => format!("{}.backup-{}", name, stamp),
    };
    crate::paths::join(parent, &backup_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::server;
    use chrono::TimeZone;

    fn believed(version: u32) -> BelievedLock {
        BelievedLock {
            file_id: "f1".into(),
            relative_path: "parts/x.sldprt".into(),
            version,
            acquired_at: Utc::now(),
        }
    }

    #[test]
    fn test_check_lock() {
        let mut srv = server("f1", "parts/x.sldprt", "h2", 1);
        srv.checked_out_by = Some("alice".into());
        assert_eq!(check_lock(&believed(1), Some(&srv), "alice"), LockCheck::StillHeld);

        srv.checked_out_by = None;
        assert_eq!(check_lock(&believed(1), Some(&srv), "alice"), LockCheck::Released);

        srv.version = 2;
        srv.updated_by = Some("admin".into());
        match check_lock(&believed(1), Some(&srv), "alice") {
            LockCheck::Orphaned(orphan) => {
                assert_eq!(orphan.new_version, 2);
                assert_eq!(orphan.checked_in_by.as_deref(), Some("admin"));
                assert_eq!(orphan.local_path, "parts/x.sldprt");
            }
            other => panic!("expected orphan, got {:?}", other),
        }

        // Someone else grabbed it after the forced checkin
        srv.checked_out_by = Some("bob".into());
        assert!(matches!(
            check_lock(&believed(1), Some(&srv), "alice"),
            LockCheck::Orphaned(_)
        ));

        assert_eq!(check_lock(&believed(1), None, "alice"), LockCheck::Missing);
    }

    #[test]
    fn test_own_checkin_is_not_orphan() {
        let mut srv = server("f1", "parts/x.sldprt", "h2", 2);
        srv.updated_by = Some("alice".into());
        assert_eq!(check_lock(&believed(1), Some(&srv), "alice"), LockCheck::Released);

        // Taken again by bob right after alice's checkin
        srv.checked_out_by = Some("bob".into());
        assert_eq!(check_lock(&believed(1), Some(&srv), "alice"), LockCheck::Released);
    }

    #[test]
    fn test_backup_path() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap();
        assert_eq!(
            backup_path("parts/x.sldprt", at),
            "parts/x.backup-20240309-140506.sldprt"
        );
        assert_eq!(backup_path("README", at), "README.backup-20240309-140506");
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("discard".parse::<ResolutionAction>().unwrap(), ResolutionAction::Discard);
        assert_eq!(
            "upload-as-new".parse::<ResolutionAction>().unwrap(),
            ResolutionAction::UploadAsNew
        );
        assert!("nope".parse::<ResolutionAction>().is_err());
    }
}
