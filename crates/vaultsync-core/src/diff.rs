//! Diff classification and local/server pairing.
//!
//! Both functions here are pure: the same snapshot always yields the same
//! records and statuses.

use std::collections::{BTreeMap, HashMap, HashSet};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::trace;

use crate::error::{Result, VaultError};
use crate::paths;
use crate::record::{DiffStatus, FileRecord, LocalEntry, ServerRecord, SyncBaseline};

/// Classify one (local, server) pair at `relative_path`.
///
/// Returns `None` only when both sides are absent. Partial data (a missing
/// hash on either side) classifies as [`DiffStatus::None`] so rendering never
/// blocks on an unhashed file.
pub fn classify(
    relative_path: &str,
    local: Option<&LocalEntry>,
    server: Option<&ServerRecord>,
    baseline: Option<&SyncBaseline>,
    ignored: bool,
) -> Option<DiffStatus> {
    let status = match (local, server) {
        (None, None) => return None,
        (Some(_), None) if ignored => DiffStatus::Ignored,
        (Some(_), None) => DiffStatus::Added,
        (None, Some(_)) if baseline.is_some() => DiffStatus::Deleted,
        (None, Some(_)) => DiffStatus::Cloud,
        (Some(local), Some(server)) => classify_both(relative_path, local, server, baseline),
    };
    Some(status)
}

fn classify_both(
    relative_path: &str,
    local: &LocalEntry,
    server: &ServerRecord,
    baseline: Option<&SyncBaseline>,
) -> DiffStatus {
    if local.is_directory {
        return DiffStatus::None;
    }
    let (Some(local_hash), Some(server_hash)) = (&local.content_hash, &server.content_hash) else {
        trace!("Missing hash for {}, treating as synced", relative_path);
        return DiffStatus::None;
    };

    if local_hash == server_hash {
        if paths::normalize(&server.path) == paths::normalize(relative_path) {
            DiffStatus::None
        } else {
            DiffStatus::Moved
        }
    } else {
        match baseline {
            // Local copy is what we last pulled, so the server moved ahead
            Some(base) if &base.content_hash == local_hash => DiffStatus::Outdated,
            _ => DiffStatus::Modified,
        }
    }
}

/// User-defined ignore patterns, matched against vault-relative paths.
///
/// A path is ignored when it or any of its ancestors matches, so `build`
/// ignores everything under `build/`.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    set: GlobSet,
}

impl IgnoreRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref().trim().trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }
            let glob = Glob::new(pattern).map_err(|e| {
                VaultError::InvalidArgument(format!("Invalid ignore pattern {}: {}", pattern, e))
            })?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }
        let set = builder
            .build()
            .map_err(|e| VaultError::InvalidArgument(format!("Invalid ignore patterns: {}", e)))?;
        Ok(Self { patterns: kept, set })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_ignored(&self, relative_path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let mut current = paths::normalize(relative_path);
        while !current.is_empty() {
            if self.set.is_match(&current) || self.set.is_match(paths::file_name(&current)) {
                return true;
            }
            current = paths::parent(&current).to_string();
        }
        false
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::empty()
    }
}

/// Pair a local scan with the server catalog and classify every entry.
///
/// Entries pair by path first. A leftover local file whose hash equals a
/// leftover server record's hash becomes one `moved` record at the local
/// path. Baselines are looked up at the local path, then at the server path.
/// Output is sorted by path.
pub fn pair_entries(
    local: Vec<LocalEntry>,
    server: Vec<ServerRecord>,
    baselines: &HashMap<String, SyncBaseline>,
    ignore: &IgnoreRules,
) -> Vec<FileRecord> {
    let mut local_by_path: BTreeMap<String, LocalEntry> = local
        .into_iter()
        .map(|mut entry| {
            entry.relative_path = paths::normalize(&entry.relative_path);
            (entry.relative_path.clone(), entry)
        })
        .collect();
    let mut server_by_path: BTreeMap<String, ServerRecord> = server
        .into_iter()
        .map(|record| (paths::normalize(&record.path), record))
        .collect();

    let mut records = Vec::with_capacity(local_by_path.len().max(server_by_path.len()));

    // Same path on both sides
    let shared: Vec<String> = local_by_path
        .keys()
        .filter(|path| server_by_path.contains_key(*path))
        .cloned()
        .collect();
    for path in shared {
        let local = local_by_path.remove(&path);
        let server = server_by_path.remove(&path);
        let baseline = baselines.get(&path).cloned();
        if let Some(record) = FileRecord::new(&path, local, server, baseline, false) {
            records.push(record);
        }
    }

    // Move detection among the leftovers, by content hash
    let mut claimed: HashSet<String> = HashSet::new();
    let mut by_hash: HashMap<&str, Vec<&String>> = HashMap::new();
    for (path, record) in &server_by_path {
        if let Some(hash) = record.content_hash.as_deref() {
            by_hash.entry(hash).or_default().push(path);
        }
    }
    let mut moved: Vec<(String, String)> = Vec::new();
    for (path, entry) in &local_by_path {
        if entry.is_directory || ignore.is_ignored(path) {
            continue;
        }
        let Some(hash) = entry.content_hash.as_deref() else {
            continue;
        };
        if let Some(candidates) = by_hash.get(hash) {
            if let Some(server_path) = candidates.iter().find(|p| !claimed.contains(p.as_str())) {
                claimed.insert((*server_path).clone());
                moved.push((path.clone(), (*server_path).clone()));
            }
        }
    }
    for (local_path, server_path) in moved {
        let local = local_by_path.remove(&local_path);
        let server = server_by_path.remove(&server_path);
        let baseline = baselines
            .get(&local_path)
            .or_else(|| baselines.get(&server_path))
            .cloned();
        if let Some(record) = FileRecord::new(&local_path, local, server, baseline, false) {
            records.push(record);
        }
    }

    for (path, entry) in local_by_path {
        let ignored = ignore.is_ignored(&path);
        if let Some(record) = FileRecord::new(&path, Some(entry), None, None, ignored) {
            records.push(record);
        }
    }
    for (path, record) in server_by_path {
        let baseline = baselines.get(&path).cloned();
        if let Some(record) = FileRecord::new(&path, None, Some(record), baseline, false) {
            records.push(record);
        }
    }

    records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::server;

    fn local(path: &str, hash: &str) -> LocalEntry {
        LocalEntry::file(path, hash, 10)
    }

    fn base(hash: &str, version: u32) -> SyncBaseline {
        SyncBaseline {
            content_hash: hash.to_string(),
            version,
        }
    }

    #[test]
    fn test_classify_single_sides() {
        let l = local("a.txt", "h1");
        let s = server("f1", "a.txt", "h1", 1);
        assert_eq!(classify("a.txt", None, None, None, false), None);
        assert_eq!(classify("a.txt", Some(&l), None, None, false), Some(DiffStatus::Added));
        assert_eq!(classify("a.txt", Some(&l), None, None, true), Some(DiffStatus::Ignored));
        assert_eq!(classify("a.txt", None, Some(&s), None, false), Some(DiffStatus::Cloud));
        assert_eq!(
            classify("a.txt", None, Some(&s), Some(&base("h1", 1)), false),
            Some(DiffStatus::Deleted)
        );
    }

    #[test]
    fn test_classify_both_present() {
        let s = server("f1", "a.txt", "h2", 2);

        // Same content, same path
        let synced = local("a.txt", "h2");
        assert_eq!(classify("a.txt", Some(&synced), Some(&s), None, false), Some(DiffStatus::None));

        // Local unchanged since pull, server advanced
        let stale = local("a.txt", "h1");
        assert_eq!(
            classify("a.txt", Some(&stale), Some(&s), Some(&base("h1", 1)), false),
            Some(DiffStatus::Outdated)
        );

        // Local edited since pull
        let edited = local("a.txt", "h9");
        assert_eq!(
            classify("a.txt", Some(&edited), Some(&s), Some(&base("h2", 2)), false),
            Some(DiffStatus::Modified)
        );
        // No baseline and differing content reads as a local edit
        assert_eq!(
            classify("a.txt", Some(&edited), Some(&s), None, false),
            Some(DiffStatus::Modified)
        );

        // Same content, different path
        let moved = local("b/a.txt", "h2");
        assert_eq!(classify("b/a.txt", Some(&moved), Some(&s), None, false), Some(DiffStatus::Moved));
    }

    #[test]
    fn test_classify_fails_open_on_partial_data() {
        let mut l = local("a.txt", "h1");
        l.content_hash = None;
        let s = server("f1", "a.txt", "h2", 2);
        assert_eq!(classify("a.txt", Some(&l), Some(&s), None, false), Some(DiffStatus::None));
    }

    #[test]
    fn test_classify_deterministic() {
        let l = local("a.txt", "h1");
        let s = server("f1", "a.txt", "h2", 3);
        let b = base("h1", 2);
        let first = classify("a.txt", Some(&l), Some(&s), Some(&b), false);
        for _ in 0..10 {
            assert_eq!(classify("a.txt", Some(&l), Some(&s), Some(&b), false), first);
        }
    }

    #[test]
    fn test_ignore_rules() {
        let rules = IgnoreRules::new(&["*.tmp", "~$*", "build/"]).unwrap();
        assert!(rules.is_ignored("parts/scratch.tmp"));
        assert!(rules.is_ignored("~$bracket.sldprt"));
        assert!(rules.is_ignored("build/out/x.step"));
        assert!(!rules.is_ignored("parts/bracket.sldprt"));
        assert!(!IgnoreRules::empty().is_ignored("x.tmp"));
        assert!(IgnoreRules::new(&["[unclosed"]).is_err());
    }

    #[test]
    fn test_pair_entries() {
        let rules = IgnoreRules::new(&["*.bak"]).unwrap();
        let mut baselines = HashMap::new();
        baselines.insert("gone.txt".to_string(), base("hg", 1));

        let records = pair_entries(
            vec![
                local("same.txt", "hs"),
                local("new/place.txt", "hm"),
                local("draft.txt", "hd"),
                local("old.bak", "hb"),
                LocalEntry::directory("new"),
            ],
            vec![
                server("f1", "same.txt", "hs", 1),
                server("f2", "old/place.txt", "hm", 1),
                server("f3", "gone.txt", "hg", 1),
                server("f4", "remote.txt", "hr", 1),
            ],
            &baselines,
            &rules,
        );

        let status: HashMap<&str, DiffStatus> = records
            .iter()
            .map(|r| (r.relative_path.as_str(), r.diff_status()))
            .collect();
        assert_eq!(status["same.txt"], DiffStatus::None);
        assert_eq!(status["new/place.txt"], DiffStatus::Moved);
        assert_eq!(status["draft.txt"], DiffStatus::Added);
        assert_eq!(status["old.bak"], DiffStatus::Ignored);
        assert_eq!(status["gone.txt"], DiffStatus::Deleted);
        assert_eq!(status["remote.txt"], DiffStatus::Cloud);
        assert_eq!(status["new"], DiffStatus::Added);
        assert!(!status.contains_key("old/place.txt"));
        assert_eq!(records.len(), 7);

        let moved = records.iter().find(|r| r.relative_path == "new/place.txt").unwrap();
        assert_eq!(moved.file_id(), Some("f2"));
    }

    #[test]
    fn test_pair_entries_sorted() {
        let records = pair_entries(
            vec![local("b.txt", "1"), local("a.txt", "2")],
            vec![server("f", "c.txt", "3", 1)],
            &HashMap::new(),
            &IgnoreRules::empty(),
        );
        let order: Vec<&str> = records.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(order, vec!["a.txt", "b.txt", "c.txt"]);
    }
}
