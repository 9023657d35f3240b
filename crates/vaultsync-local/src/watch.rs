use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vaultsync_engine::Vault;

/// Vault-relative, forward-slash path of `path`, or `None` when it lies
/// outside the vault or inside an excluded directory.
pub fn relative_path(root: &Path, path: &Path, excluded: &[&str]) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    match parts.first() {
        None => None,
        Some(first) if excluded.contains(&first.as_str()) => None,
        Some(_) => Some(parts.join("/")),
    }
}

fn is_content_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Feed filesystem events into the store and reconcile believed locks every
/// `reconcile_every` until `shutdown` resolves.
pub async fn run(
    vault: &Vault,
    root: &Path,
    excluded: &[&str],
    reconcile_every: Duration,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let root: PathBuf = root
        .canonicalize()
        .with_context(|| format!("Vault root {} not found", root.display()))?;
    let (tx, mut rx) = mpsc::channel::<Event>(1000);

    // The watcher stops when dropped, so it lives for the whole loop
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => warn!("Watch error: {}", e),
        },
        NotifyConfig::default(),
    )
    .context("Failed to create filesystem watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    info!("Watching {}", root.display());

    let mut ticker = tokio::time::interval(reconcile_every);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let report = vault.reconcile().await;
                debug!(
                    "Reconciled {} believed locks: {} orphaned, {} errors",
                    report.checked, report.orphaned.len(), report.errors
                );
            }
            Some(event) = rx.recv() => {
                // Coalesce a burst of events into one re-stat per path
                let mut changed = BTreeSet::new();
                let mut next = Some(event);
                while let Some(event) = next {
                    if is_content_event(&event.kind) {
                        changed.extend(
                            event
                                .paths
                                .iter()
                                .filter_map(|p| relative_path(&root, p, excluded)),
                        );
                    }
                    next = rx.try_recv().ok();
                }
                for path in changed {
                    if let Err(e) = vault.local_changed(&path).await {
                        warn!("Failed to refresh {}: {}", path, e);
                    }
                }
            }
        }
    }

    info!("Stopped watching {}", root.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use vaultsync_core::{DiffStatus, IgnoreRules, SilentNotifier};
    use vaultsync_engine::{LocalDisk, MemoryBackend, VaultOptions};

    #[test]
    fn test_relative_path() {
        let root = Path::new("/vault");
        assert_eq!(
            relative_path(root, Path::new("/vault/parts/a.sldprt"), &[".vaultsync"]),
            Some("parts/a.sldprt".to_string())
        );
        assert_eq!(
            relative_path(root, Path::new("/vault/.vaultsync/state"), &[".vaultsync"]),
            None
        );
        assert_eq!(relative_path(root, Path::new("/elsewhere/a"), &[]), None);
        assert_eq!(relative_path(root, Path::new("/vault"), &[]), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_file_becomes_added() {
        let temp = TempDir::new().unwrap();
        let vault = Vault::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(LocalDisk::new(temp.path())),
            Arc::new(SilentNotifier),
            VaultOptions {
                vault_id: "vault-1".into(),
                org_id: "org-1".into(),
                user_id: "alice".into(),
                ignore: IgnoreRules::empty(),
            },
        );
        vault.refresh().await.unwrap();

        let root = temp.path().to_path_buf();
        let writer = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tokio::fs::write(root.join("new.txt"), b"hello").await.unwrap();
            // Poll until the watcher has folded the event in
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if vault.store().get("new.txt").is_some() {
                    break;
                }
            }
        };
        run(&vault, &root, &[], Duration::from_secs(3600), writer)
            .await
            .unwrap();

        let record = vault.store().get("new.txt").unwrap();
        assert_eq!(record.diff_status(), DiffStatus::Added);
    }
}
