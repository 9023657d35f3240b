mod backend;
mod commands;
mod config;
mod notifier;
mod state;
mod watch;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vaultsync_core::{IgnoreRules, VaultBackend};
use vaultsync_engine::{LocalDisk, Vault, VaultOptions};
use vaultsync_rest::{RestBackend, RestConfig};

use backend::FileCatalogBackend;
use config::{BackendKind, Command, Config};
use notifier::ConsoleNotifier;

fn create_backend(config: &Config) -> anyhow::Result<Arc<dyn VaultBackend>> {
    match config.backend {
        BackendKind::Local => {
            let dir = config.effective_catalog_dir();
            info!("  Catalog dir: {}", dir.display());
            Ok(Arc::new(FileCatalogBackend::new(dir)))
        }
        BackendKind::Rest => {
            let url = config
                .server_url
                .clone()
                .context("--server-url is required with --backend rest")?;
            let api_key = config
                .api_key
                .clone()
                .context("--api-key is required with --backend rest")?;
            info!("  Server: {}", url);
            let mut rest = RestConfig::new(url, api_key).with_bucket(config.bucket.clone());
            if let Some(token) = &config.access_token {
                rest = rest.with_access_token(token.clone());
            }
            Ok(Arc::new(RestBackend::new(rest)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let user = config.effective_user();
    info!("Starting vaultsync");
    info!("  Vault: {} at {}", config.vault_id, config.vault_root.display());
    info!("  User: {}", user);
    info!("  Backend: {}", config.backend);

    let backend = create_backend(&config)?;
    let ignore = IgnoreRules::new(&config.ignore)?;
    let notifier = Arc::new(ConsoleNotifier::new());
    let vault = Vault::new(
        backend,
        Arc::new(LocalDisk::new(&config.vault_root)),
        notifier.clone(),
        VaultOptions {
            vault_id: config.vault_id.clone(),
            org_id: config.org_id.clone(),
            user_id: user,
            ignore,
        },
    );

    let state_file = config.state_file();
    vault.import_state(state::load(&state_file).await);
    let records = vault.refresh().await?;
    info!("Loaded {} records", records);

    // Startup reconciliation catches checkouts forced in while we were away
    if !matches!(config.command, Command::Reconcile) {
        let report = vault.reconcile().await;
        if !report.orphaned.is_empty() {
            warn!(
                "{} checkout(s) were checked in by someone else",
                report.orphaned.len()
            );
        }
    }

    let result = commands::dispatch(&vault, &config, &notifier).await;

    if let Err(e) = state::save(&state_file, &vault.export_state()).await {
        warn!("Failed to save client state: {}", e);
    }
    result
}
