//! Legality checks for lock-sensitive commands.
//!
//! These run before any state-mutating call so a caller can disable and
//! explain an action instead of attempting it.

use serde::Serialize;

use crate::error::VaultError;
use crate::record::{DiffStatus, FileRecord, LockState};

/// Why an action is unavailable for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Blocked {
    /// Someone else holds the lock.
    LockedBy(String),
    /// The action needs the caller to hold the lock.
    NotCheckedOut,
    /// The caller holds the lock and must check in or undo first.
    CheckedOutByMe,
    /// The file has no server record yet.
    NotOnServer,
    /// The file has no local copy.
    NotLocal,
    /// Already uploaded; new content is published through checkin.
    AlreadyOnServer,
    /// Folders are not lockable.
    Directory,
    /// Local edits would be overwritten.
    LocalChanges,
}

impl Blocked {
    pub fn into_error(self, path: &str) -> VaultError {
        match self {
            Blocked::LockedBy(holder) => VaultError::AlreadyLocked { holder },
            Blocked::NotCheckedOut => VaultError::NotOwner(path.to_string()),
            Blocked::CheckedOutByMe => {
                VaultError::InvalidArgument(format!("{} is checked out; check in or undo first", path))
            }
            Blocked::NotOnServer => VaultError::NotFound(format!("{} has no server record", path)),
            Blocked::NotLocal => VaultError::NotFound(format!("{} has no local copy", path)),
            Blocked::AlreadyOnServer => {
                VaultError::InvalidArgument(format!("{} is already on the server", path))
            }
            Blocked::Directory => VaultError::InvalidArgument(format!("{} is a folder", path)),
            Blocked::LocalChanges => {
                VaultError::InvalidArgument(format!("{} has local changes", path))
            }
        }
    }
}

pub type Check = std::result::Result<(), Blocked>;

fn server_file(record: &FileRecord) -> Check {
    if record.is_directory {
        return Err(Blocked::Directory);
    }
    if record.server.is_none() {
        return Err(Blocked::NotOnServer);
    }
    Ok(())
}

/// Checkout is allowed unless another user holds the lock. Re-checking out a
/// file the caller already holds is allowed and reported as a no-op.
pub fn can_checkout(record: &FileRecord, user_id: &str) -> Check {
    server_file(record)?;
    match record.lock_state(user_id) {
        LockState::LockedByOther(holder) => Err(Blocked::LockedBy(holder)),
        _ => Ok(()),
    }
}

pub fn can_checkin(record: &FileRecord, user_id: &str) -> Check {
    server_file(record)?;
    if record.local.is_none() {
        return Err(Blocked::NotLocal);
    }
    match record.lock_state(user_id) {
        LockState::LockedByMe => Ok(()),
        _ => Err(Blocked::NotCheckedOut),
    }
}

pub fn can_undo_checkout(record: &FileRecord, user_id: &str) -> Check {
    server_file(record)?;
    match record.lock_state(user_id) {
        LockState::LockedByMe => Ok(()),
        _ => Err(Blocked::NotCheckedOut),
    }
}

/// Renaming a synced file needs the lock; unsynced files move freely.
pub fn can_rename(record: &FileRecord, user_id: &str) -> Check {
    if record.local.is_none() {
        return Err(Blocked::NotLocal);
    }
    if record.server.is_none() || record.is_directory {
        return Ok(());
    }
    match record.lock_state(user_id) {
        LockState::LockedByMe => Ok(()),
        LockState::LockedByOther(holder) => Err(Blocked::LockedBy(holder)),
        LockState::Unlocked => Err(Blocked::NotCheckedOut),
    }
}

/// A folder moves with everything below it, so no file under it may be
/// checked out by someone else.
pub fn can_rename_folder<'a, I>(folder: &FileRecord, below: I, user_id: &str) -> Check
where
    I: IntoIterator<Item = &'a FileRecord>,
{
    can_rename(folder, user_id)?;
    for record in below {
        if let LockState::LockedByOther(holder) = record.lock_state(user_id) {
            return Err(Blocked::LockedBy(holder));
        }
    }
    Ok(())
}

pub fn can_delete_local(record: &FileRecord, user_id: &str) -> Check {
    if record.local.is_none() {
        return Err(Blocked::NotLocal);
    }
    match record.lock_state(user_id) {
        LockState::LockedByMe => Err(Blocked::CheckedOutByMe),
        _ => Ok(()),
    }
}

pub fn can_delete_from_server(record: &FileRecord, user_id: &str) -> Check {
    server_file(record)?;
    match record.lock_state(user_id) {
        LockState::LockedByOther(holder) => Err(Blocked::LockedBy(holder)),
        _ => Ok(()),
    }
}

pub fn can_download(record: &FileRecord) -> Check {
    server_file(record)?;
    match record.diff_status() {
        DiffStatus::Modified => Err(Blocked::LocalChanges),
        _ => Ok(()),
    }
}

pub fn can_upload(record: &FileRecord) -> Check {
    if record.is_directory {
        return Err(Blocked::Directory);
    }
    if record.local.is_none() {
        return Err(Blocked::NotLocal);
    }
    match record.diff_status() {
        DiffStatus::Added => Ok(()),
        _ => Err(Blocked::AlreadyOnServer),
    }
}

/// Availability of every lock-sensitive action for one file.
#[derive(Debug, Clone, Serialize)]
pub struct Affordances {
    pub checkout: Check,
    pub checkin: Check,
    pub undo_checkout: Check,
    pub rename: Check,
    pub delete_local: Check,
    pub delete_from_server: Check,
    pub download: Check,
    pub upload: Check,
}

pub fn affordances(record: &FileRecord, user_id: &str) -> Affordances {
    Affordances {
        checkout: can_checkout(record, user_id),
        checkin: can_checkin(record, user_id),
        undo_checkout: can_undo_checkout(record, user_id),
        rename: can_rename(record, user_id),
        delete_local: can_delete_local(record, user_id),
        delete_from_server: can_delete_from_server(record, user_id),
        download: can_download(record),
        upload: can_upload(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::server;
    use crate::record::LocalEntry;

    fn record(holder: Option<&str>) -> FileRecord {
        let mut srv = server("f1", "a.txt", "h1", 1);
        srv.checked_out_by = holder.map(str::to_string);
        FileRecord::new("a.txt", Some(LocalEntry::file("a.txt", "h1", 10)), Some(srv), None, false)
            .unwrap()
    }

    #[test]
    fn test_checkout_rules() {
        assert_eq!(can_checkout(&record(None), "alice"), Ok(()));
        assert_eq!(can_checkout(&record(Some("alice")), "alice"), Ok(()));
        assert_eq!(
            can_checkout(&record(Some("bob")), "alice"),
            Err(Blocked::LockedBy("bob".into()))
        );
    }

    #[test]
    fn test_checkin_rules() {
        assert_eq!(can_checkin(&record(Some("alice")), "alice"), Ok(()));
        assert_eq!(can_checkin(&record(None), "alice"), Err(Blocked::NotCheckedOut));
        assert_eq!(can_checkin(&record(Some("bob")), "alice"), Err(Blocked::NotCheckedOut));
    }

    #[test]
    fn test_rename_and_delete_rules() {
        assert_eq!(can_rename(&record(None), "alice"), Err(Blocked::NotCheckedOut));
        assert_eq!(can_rename(&record(Some("alice")), "alice"), Ok(()));
        assert_eq!(can_delete_local(&record(Some("alice")), "alice"), Err(Blocked::CheckedOutByMe));
        assert_eq!(
            can_delete_from_server(&record(Some("bob")), "alice"),
            Err(Blocked::LockedBy("bob".into()))
        );

        let added =
            FileRecord::new("n.txt", Some(LocalEntry::file("n.txt", "h", 1)), None, None, false)
                .unwrap();
        assert_eq!(can_rename(&added, "alice"), Ok(()));
        assert_eq!(can_checkout(&added, "alice"), Err(Blocked::NotOnServer));
        assert_eq!(can_upload(&added), Ok(()));
        assert_eq!(can_upload(&record(None)), Err(Blocked::AlreadyOnServer));
    }

    #[test]
    fn test_rename_folder_rules() {
        let folder = FileRecord::new("parts", Some(LocalEntry::directory("parts")), None, None, true)
            .unwrap();
        let free = record(None);
        let taken = record(Some("bob"));
        assert_eq!(can_rename_folder(&folder, [&free], "alice"), Ok(()));
        assert_eq!(
            can_rename_folder(&folder, [&free, &taken], "alice"),
            Err(Blocked::LockedBy("bob".into()))
        );
    }

    #[test]
    fn test_blocked_into_error() {
        let err = Blocked::LockedBy("bob".into()).into_error("a.txt");
        assert_eq!(err, VaultError::AlreadyLocked { holder: "bob".into() });
        assert_eq!(
            Blocked::NotCheckedOut.into_error("a.txt"),
            VaultError::NotOwner("a.txt".into())
        );
    }
}
