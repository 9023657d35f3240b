use std::path::Path;

use anyhow::Context;
use tracing::{debug, warn};
use vaultsync_engine::PersistedState;

/// Load persisted client state. A missing file is a fresh client; an
/// unreadable one is logged and treated the same way.
pub async fn load(path: &Path) -> PersistedState {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No state file at {}", path.display());
            return PersistedState::default();
        }
        Err(e) => {
            warn!("Failed to read state file {}: {}", path.display(), e);
            return PersistedState::default();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => state,
        Err(e) => {
            warn!("Ignoring corrupt state file {}: {}", path.display(), e);
            PersistedState::default()
        }
    }
}

/// Save client state through a temp file and rename.
pub async fn save(path: &Path, state: &PersistedState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create state dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(state)?;
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, &data)
        .await
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp file to {}", path.display()))?;
    debug!(
        "Saved state: {} baselines, {} believed locks, {} orphans",
        state.baselines.len(),
        state.believed_locks.len(),
        state.orphans.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use vaultsync_core::{BelievedLock, SyncBaseline};

    #[tokio::test]
    async fn test_save_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("v1-alice.json");

        let mut state = PersistedState::default();
        state.baselines.insert(
            "parts/a.sldprt".into(),
            SyncBaseline {
                content_hash: "abc".into(),
                version: 3,
            },
        );
        state.believed_locks.push(BelievedLock {
            file_id: "file-1".into(),
            relative_path: "parts/a.sldprt".into(),
            version: 3,
            acquired_at: Utc::now(),
        });

        save(&path, &state).await.unwrap();
        assert_eq!(load(&path).await, state);
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_is_fresh() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        assert_eq!(load(&path).await, PersistedState::default());

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert_eq!(load(&path).await, PersistedState::default());
    }
}
