use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::signal;
use vaultsync_core::{paths, DiffStatus, LockState, SerializationSettings};
use vaultsync_engine::{BatchOutcome, Vault};

use crate::config::{Command, Config, SerialCommand};
use crate::notifier::ConsoleNotifier;
use crate::watch;

/// Directories inside the vault that never take part in sync.
pub const EXCLUDED_DIRS: &[&str] = &[".vaultsync"];

/// Print per-file failures and turn an incomplete batch into an error exit.
fn finish(outcome: &BatchOutcome) -> anyhow::Result<()> {
    for (path, error) in &outcome.failed {
        println!("  failed   {}: {}", path, error);
    }
    for path in &outcome.skipped {
        println!("  skipped  {}", path);
    }
    if !outcome.failed.is_empty() {
        bail!("{} of {} files failed", outcome.failed.len(), outcome.total());
    }
    if outcome.cancelled {
        bail!("Cancelled after {} of {} files", outcome.succeeded.len(), outcome.total());
    }
    Ok(())
}

fn lock_label(state: &LockState) -> String {
    match state {
        LockState::Unlocked => String::new(),
        LockState::LockedByMe => "[me]".to_string(),
        LockState::LockedByOther(holder) => format!("[{}]", holder),
    }
}

fn status(vault: &Vault, all: bool) {
    let mut records = vault.store().snapshot();
    records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    for record in records
        .iter()
        .filter(|r| !r.is_directory && (all || r.diff_status() != DiffStatus::None))
    {
        println!(
            "{:<9} {:<12} {}",
            record.diff_status(),
            lock_label(&record.lock_state(vault.user_id())),
            record.relative_path
        );
    }
    let orphans = vault.orphans();
    if !orphans.is_empty() {
        println!(
            "{} orphaned checkout(s); run `vaultsync orphans` to review",
            orphans.len()
        );
    }
}

async fn serial(vault: &Vault, command: SerialCommand) -> anyhow::Result<()> {
    let counter = vault.serial();
    match command {
        SerialCommand::Show => {
            let settings = counter.settings().await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SerialCommand::Save { path } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let settings: SerializationSettings = serde_json::from_slice(&data)
                .with_context(|| format!("Invalid settings in {}", path.display()))?;
            counter.save_settings(&settings).await?;
            println!("Saved serialization settings");
        }
        SerialCommand::Preview { tab } => match counter.preview_next(tab).await? {
            Some(next) => println!("{}", next),
            None => println!("Serialization is disabled"),
        },
        SerialCommand::Next { tab, file } => {
            let allocated = match &file {
                Some(name) => counter.allocate_for(name, tab).await?,
                None => counter.allocate_next(tab).await?,
            };
            match allocated {
                Some(value) => println!("{}", value),
                None => println!("No serial number allocated"),
            }
        }
        SerialCommand::Detect { apply } => {
            let records = vault.store().snapshot();
            let stems: Vec<&str> = records
                .iter()
                .filter(|r| !r.is_directory)
                .filter_map(|r| Path::new(paths::file_name(&r.relative_path)).file_stem())
                .filter_map(|s| s.to_str())
                .collect();
            match counter.detect_highest(stems).await? {
                Some(highest) if apply => {
                    counter.set_counter(highest).await?;
                    println!("Counter set to {}", highest);
                }
                Some(highest) => println!("Highest number in use: {}", highest),
                None => println!("No numbered files found"),
            }
        }
        SerialCommand::Set { value } => {
            counter.set_counter(value).await?;
            println!("Counter set to {}", value);
        }
    }
    Ok(())
}

pub async fn dispatch(
    vault: &Vault,
    config: &Config,
    notifier: &Arc<ConsoleNotifier>,
) -> anyhow::Result<()> {
    match config.command.clone() {
        Command::Status { all } => status(vault, all),
        Command::Checkout { paths } => {
            notifier.cancel_on_ctrl_c();
            finish(&vault.checkout(&paths).await?)?;
        }
        Command::Checkin { paths, message } => {
            notifier.cancel_on_ctrl_c();
            finish(&vault.checkin(&paths, message).await?)?;
        }
        Command::Undo { paths } => {
            notifier.cancel_on_ctrl_c();
            finish(&vault.undo_checkout(&paths).await?)?;
        }
        Command::Download { paths } => {
            notifier.cancel_on_ctrl_c();
            finish(&vault.download(&paths).await?)?;
        }
        Command::Upload { paths } => {
            notifier.cancel_on_ctrl_c();
            finish(&vault.upload_new(&paths).await?)?;
        }
        Command::Rename { from, to } => {
            vault.rename(&from, &to).await?;
            println!("Renamed {} -> {}", from, to);
        }
        Command::Delete {
            paths,
            server: false,
            ..
        } => {
            notifier.cancel_on_ctrl_c();
            finish(&vault.delete_local(&paths).await?)?;
        }
        Command::Delete {
            paths,
            server: true,
            yes,
        } => {
            let plan = vault.plan_server_delete(&paths);
            for (path, reason) in &plan.blocked {
                println!("  blocked  {}: {}", path, reason.clone().into_error(path));
            }
            if plan.is_empty() {
                bail!("Nothing to delete from the server");
            }
            for file in &plan.files {
                println!("  delete   {} (v{})", file.relative_path, file.version);
            }
            if !yes {
                println!(
                    "Re-run with --yes to delete {} file(s) from the server",
                    plan.files.len()
                );
                return Ok(());
            }
            notifier.cancel_on_ctrl_c();
            finish(&vault.delete_from_server(plan).await?)?;
        }
        Command::ForceCheckin { path } => {
            let record = vault.force_checkin(&path).await?;
            println!("{} checked in as version {}", record.path, record.version);
        }
        Command::Reconcile => {
            let report = vault.reconcile().await;
            println!(
                "Checked {} checkouts: {} held, {} released, {} missing, {} orphaned, {} errors",
                report.checked,
                report.still_held,
                report.released,
                report.missing,
                report.orphaned.len(),
                report.errors
            );
        }
        Command::Orphans => {
            for orphan in vault.orphans() {
                println!(
                    "{}  {}  v{} by {}{}",
                    orphan.file_id,
                    orphan.local_path,
                    orphan.new_version,
                    orphan.checked_in_by.as_deref().unwrap_or("unknown"),
                    orphan
                        .last_error
                        .as_deref()
                        .map(|e| format!("  (last attempt failed: {})", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Resolve { action, file_ids } => {
            let file_ids = if file_ids.is_empty() {
                vault.orphans().into_iter().map(|o| o.file_id).collect()
            } else {
                file_ids
            };
            if file_ids.is_empty() {
                println!("No orphaned checkouts");
                return Ok(());
            }
            notifier.cancel_on_ctrl_c();
            finish(&vault.resolve_orphans(file_ids, action).await)?;
        }
        Command::Dismiss { file_id } => {
            let orphan = vault.dismiss_orphan(&file_id)?;
            println!("Dismissed orphaned checkout of {}", orphan.local_path);
        }
        Command::Serial { command } => serial(vault, command).await?,
        Command::Repair => {
            let report = vault.repair_read_only().await?;
            println!(
                "Checked {} files: {} corrected, {} failed, {} checkouts adopted",
                report.checked,
                report.corrected.len(),
                report.failed.len(),
                report.adopted.len()
            );
            for path in &report.failed {
                println!("  failed   {}", path);
            }
        }
        Command::Watch { reconcile_secs } => {
            let shutdown = async {
                if signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            watch::run(
                vault,
                &config.vault_root,
                EXCLUDED_DIRS,
                Duration::from_secs(reconcile_secs.max(1)),
                shutdown,
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_core::VaultError;

    #[test]
    fn test_finish() {
        let ok = BatchOutcome {
            succeeded: vec!["a".into()],
            ..Default::default()
        };
        assert!(finish(&ok).is_ok());

        let partial = BatchOutcome {
            succeeded: vec!["a".into()],
            failed: vec![("b".into(), VaultError::Network("offline".into()))],
            ..Default::default()
        };
        assert_eq!(finish(&partial).unwrap_err().to_string(), "1 of 2 files failed");

        let cancelled = BatchOutcome {
            succeeded: vec!["a".into()],
            skipped: vec!["b".into(), "c".into()],
            cancelled: true,
            ..Default::default()
        };
        assert_eq!(
            finish(&cancelled).unwrap_err().to_string(),
            "Cancelled after 1 of 3 files"
        );
    }

    #[test]
    fn test_lock_label() {
        assert_eq!(lock_label(&LockState::Unlocked), "");
        assert_eq!(lock_label(&LockState::LockedByMe), "[me]");
        assert_eq!(lock_label(&LockState::LockedByOther("bob".into())), "[bob]");
    }
}
