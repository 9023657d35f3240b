//! In-memory FileRecord store with change events.
//!
//! Records are rebuilt, never patched: every mutation goes through
//! `FileRecord::new`, so the diff status always matches its inputs.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use vaultsync_core::paths;
use vaultsync_core::{
    pair_entries, BelievedLock, DiffStatus, FileRecord, IgnoreRules, LocalEntry,
    OrphanedCheckout, ServerRecord, SyncBaseline,
};

const EVENT_CAPACITY: usize = 256;

/// Notification published after the store changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The whole store was rebuilt from a scan and a server listing.
    Refreshed { records: usize },
    /// One path was rebuilt; `status` is `None` if the record is gone.
    Changed {
        path: String,
        status: Option<DiffStatus>,
    },
    OrphanDetected { file_id: String },
    OrphanCleared { file_id: String },
}

/// Client state that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub baselines: BTreeMap<String, SyncBaseline>,
    #[serde(default)]
    pub believed_locks: Vec<BelievedLock>,
    #[serde(default)]
    pub orphans: Vec<OrphanedCheckout>,
}

pub struct FileStore {
    records: DashMap<String, FileRecord>,
    baselines: DashMap<String, SyncBaseline>,
    /// Keyed by file id
    believed: DashMap<String, BelievedLock>,
    /// Keyed by file id
    orphans: DashMap<String, OrphanedCheckout>,
    ignore: IgnoreRules,
    events: broadcast::Sender<StoreEvent>,
}

impl FileStore {
    pub fn new(ignore: IgnoreRules) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: DashMap::new(),
            baselines: DashMap::new(),
            believed: DashMap::new(),
            orphans: DashMap::new(),
            ignore,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn ignore_rules(&self) -> &IgnoreRules {
        &self.ignore
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Replace every record with a fresh pairing of `local` and `server`.
    pub fn apply_snapshot(&self, local: Vec<LocalEntry>, server: Vec<ServerRecord>) {
        let baselines: HashMap<String, SyncBaseline> = self
            .baselines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let records = pair_entries(local, server, &baselines, &self.ignore);

        self.records.clear();
        for record in records {
            self.records.insert(record.relative_path.clone(), record);
        }
        debug!("Store refreshed with {} records", self.records.len());
        self.publish(StoreEvent::Refreshed {
            records: self.records.len(),
        });
    }

    pub fn get(&self, relative_path: &str) -> Option<FileRecord> {
        self.records
            .get(&paths::normalize(relative_path))
            .map(|r| r.value().clone())
    }

    pub fn find_by_id(&self, file_id: &str) -> Option<FileRecord> {
        self.records
            .iter()
            .find(|r| r.value().file_id() == Some(file_id))
            .map(|r| r.value().clone())
    }

    /// All records sorted by path.
    pub fn snapshot(&self) -> Vec<FileRecord> {
        let mut records: Vec<FileRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        records
    }

    /// Records at or below `relative_path`.
    pub fn under(&self, relative_path: &str) -> Vec<FileRecord> {
        let root = paths::normalize(relative_path);
        let mut records: Vec<FileRecord> = self
            .records
            .iter()
            .filter(|r| {
                let path = r.key();
                root.is_empty()
                    || *path == root
                    || (path.starts_with(&root) && path.as_bytes().get(root.len()) == Some(&b'/'))
            })
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn rebuild(&self, path: &str, local: Option<LocalEntry>, server: Option<ServerRecord>) {
        let baseline = self.baselines.get(path).map(|b| b.value().clone());
        let ignored = self.ignore.is_ignored(path);
        let record = FileRecord::new(path, local, server, baseline, ignored);
        let status = record.as_ref().map(|r| r.diff_status());
        match record {
            Some(record) => {
                self.records.insert(path.to_string(), record);
            }
            None => {
                self.records.remove(path);
            }
        }
        debug!("Rebuilt {} -> {:?}", path, status);
        self.publish(StoreEvent::Changed {
            path: path.to_string(),
            status,
        });
    }

    /// Record a fresh stat of one local entry.
    pub fn upsert_local(&self, entry: LocalEntry) {
        let path = paths::normalize(&entry.relative_path);
        let server = match self.records.get(&path).and_then(|r| r.server.clone()) {
            Some(server) => Some(server),
            // An unpaired server record at the same path
            None => self
                .records
                .iter()
                .find(|r| r.local.is_none() && r.server.as_ref().map(|s| s.path.as_str()) == Some(path.as_str()))
                .and_then(|r| r.server.clone()),
        };
        self.rebuild(&path, Some(entry), server);
    }

    /// The local entry at `relative_path` is gone.
    pub fn remove_local(&self, relative_path: &str) {
        let path = paths::normalize(relative_path);
        let server = self.records.get(&path).and_then(|r| r.server.clone());
        match server {
            // A moved record falls back to its server path
            Some(server) if paths::normalize(&server.path) != path => {
                self.records.remove(&path);
                self.publish(StoreEvent::Changed {
                    path: path.clone(),
                    status: None,
                });
                let server_path = paths::normalize(&server.path);
                self.rebuild(&server_path, None, Some(server));
            }
            server => self.rebuild(&path, None, server),
        }
    }

    /// Apply a fresher copy of a server record.
    pub fn upsert_server(&self, server: ServerRecord) {
        let key = self
            .records
            .iter()
            .find(|r| r.value().file_id() == Some(server.id.as_str()))
            .map(|r| r.key().clone())
            .unwrap_or_else(|| paths::normalize(&server.path));
        let local = self.records.get(&key).and_then(|r| r.local.clone());
        self.rebuild(&key, local, Some(server));
    }

    /// The server no longer has `file_id`.
    pub fn remove_server(&self, file_id: &str) {
        let key = self
            .records
            .iter()
            .find(|r| r.value().file_id() == Some(file_id))
            .map(|r| r.key().clone());
        if let Some(key) = key {
            let local = self.records.get(&key).and_then(|r| r.local.clone());
            self.baselines.remove(&key);
            self.rebuild(&key, local, None);
        }
    }

    /// Move a record's key after a local rename.
    pub fn rename(&self, from: &str, to: &str) {
        let from = paths::normalize(from);
        let to = paths::normalize(to);
        let Some((_, record)) = self.records.remove(&from) else {
            return;
        };
        if let Some((_, baseline)) = self.baselines.remove(&from) {
            self.baselines.insert(to.clone(), baseline);
        }
        self.publish(StoreEvent::Changed {
            path: from,
            status: None,
        });
        let local = record.local.map(|mut l| {
            l.relative_path = to.clone();
            l
        });
        self.rebuild(&to, local, record.server);
    }

    // =========================================================================
    // Baselines
    // =========================================================================

    pub fn baseline(&self, relative_path: &str) -> Option<SyncBaseline> {
        self.baselines
            .get(&paths::normalize(relative_path))
            .map(|b| b.value().clone())
    }

    /// Record what was last pulled or pushed at `relative_path` and
    /// re-classify it.
    pub fn set_baseline(&self, relative_path: &str, baseline: Option<SyncBaseline>) {
        let path = paths::normalize(relative_path);
        match baseline {
            Some(baseline) => {
                self.baselines.insert(path.clone(), baseline);
            }
            None => {
                self.baselines.remove(&path);
            }
        }
        if let Some(record) = self.records.get(&path).map(|r| r.value().clone()) {
            self.rebuild(&path, record.local, record.server);
        }
    }

    // =========================================================================
    // Believed locks
    // =========================================================================

    pub fn believe(&self, lock: BelievedLock) {
        debug!("Believing lock on {} ({})", lock.relative_path, lock.file_id);
        self.believed.insert(lock.file_id.clone(), lock);
    }

    pub fn forget(&self, file_id: &str) -> Option<BelievedLock> {
        self.believed.remove(file_id).map(|(_, lock)| lock)
    }

    pub fn believed_lock(&self, file_id: &str) -> Option<BelievedLock> {
        self.believed.get(file_id).map(|l| l.value().clone())
    }

    pub fn believed_locks(&self) -> Vec<BelievedLock> {
        let mut locks: Vec<BelievedLock> = self.believed.iter().map(|l| l.value().clone()).collect();
        locks.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        locks
    }

    // =========================================================================
    // Orphans
    // =========================================================================

    /// Track an orphan. Returns false if one is already tracked for the file.
    pub fn add_orphan(&self, orphan: OrphanedCheckout) -> bool {
        let file_id = orphan.file_id.clone();
        let inserted = match self.orphans.entry(file_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(orphan);
                true
            }
        };
        if inserted {
            self.publish(StoreEvent::OrphanDetected { file_id });
        }
        inserted
    }

    pub fn orphan(&self, file_id: &str) -> Option<OrphanedCheckout> {
        self.orphans.get(file_id).map(|o| o.value().clone())
    }

    pub fn orphans(&self) -> Vec<OrphanedCheckout> {
        let mut orphans: Vec<OrphanedCheckout> = self.orphans.iter().map(|o| o.value().clone()).collect();
        orphans.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        orphans
    }

    pub fn remove_orphan(&self, file_id: &str) -> Option<OrphanedCheckout> {
        let removed = self.orphans.remove(file_id).map(|(_, o)| o);
        if removed.is_some() {
            self.publish(StoreEvent::OrphanCleared {
                file_id: file_id.to_string(),
            });
        }
        removed
    }

    pub fn set_orphan_error(&self, file_id: &str, error: Option<String>) {
        if let Some(mut orphan) = self.orphans.get_mut(file_id) {
            orphan.last_error = error;
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn export_state(&self) -> PersistedState {
        PersistedState {
            baselines: self
                .baselines
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            believed_locks: self.believed_locks(),
            orphans: self.orphans(),
        }
    }

    /// Load persisted state. Records are not touched; call
    /// [`apply_snapshot`](Self::apply_snapshot) afterwards.
    pub fn import_state(&self, state: PersistedState) {
        self.baselines.clear();
        for (path, baseline) in state.baselines {
            self.baselines.insert(paths::normalize(&path), baseline);
        }
        self.believed.clear();
        for lock in state.believed_locks {
            self.believed.insert(lock.file_id.clone(), lock);
        }
        self.orphans.clear();
        for orphan in state.orphans {
            self.orphans.insert(orphan.file_id.clone(), orphan);
        }
    }
}
