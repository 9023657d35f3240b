//! Read-only drift repair.
//!
//! Lock acquisition and the read-only toggle are not transactional. This
//! pass makes every local file's bit match server lock ownership again and
//! adopts server-confirmed locks the client forgot about.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use vaultsync_core::BelievedLock;

use crate::context::VaultContext;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub checked: usize,
    pub corrected: Vec<String>,
    pub failed: Vec<String>,
    /// Locks held on the server that were missing from the believed set
    pub adopted: Vec<String>,
}

pub async fn repair_read_only(ctx: &VaultContext) -> RepairReport {
    let mut report = RepairReport::default();

    for record in ctx.store.snapshot() {
        if record.is_directory || record.local.is_none() {
            continue;
        }
        let path = record.relative_path.clone();

        if let Some(server) = &record.server {
            if server.is_checked_out_by(&ctx.user_id) && ctx.store.believed_lock(&server.id).is_none() {
                ctx.store.believe(BelievedLock {
                    file_id: server.id.clone(),
                    relative_path: path.clone(),
                    version: server.version,
                    acquired_at: server.checked_out_at.unwrap_or_else(Utc::now),
                });
                report.adopted.push(path.clone());
            }
        }

        report.checked += 1;
        let expected = record.expected_read_only(&ctx.user_id);
        let actual = match ctx.fs.is_read_only(&path).await {
            Ok(actual) => actual,
            Err(e) => {
                warn!("Failed to read attributes of {}: {}", path, e);
                report.failed.push(path);
                continue;
            }
        };
        if actual == expected {
            continue;
        }

        debug!("Correcting read-only on {}: {} -> {}", path, actual, expected);
        match ctx.fs.set_read_only(&path, expected).await {
            Ok(()) => {
                if let Err(e) = ctx.refresh_local(&path).await {
                    warn!("Failed to re-stat {}: {}", path, e);
                }
                report.corrected.push(path);
            }
            Err(e) => {
                warn!("Failed to set read-only={} on {}: {}", expected, path, e);
                report.failed.push(path);
            }
        }
    }

    info!(
        "Read-only repair: {} checked, {} corrected, {} failed, {} locks adopted",
        report.checked,
        report.corrected.len(),
        report.failed.len(),
        report.adopted.len()
    );
    report
}
