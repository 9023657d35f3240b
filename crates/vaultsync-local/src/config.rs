use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vaultsync_core::ResolutionAction;

/// Configuration for the vaultsync command-line client.
#[derive(Parser, Debug, Clone)]
#[command(name = "vaultsync")]
#[command(about = "Sync a local vault with its server catalog and manage checkouts")]
pub struct Config {
    /// Root directory of the local vault
    #[arg(long, default_value = ".", env = "VAULTSYNC_ROOT")]
    pub vault_root: PathBuf,

    /// Vault identifier on the server
    #[arg(long, default_value = "default", env = "VAULTSYNC_VAULT_ID")]
    pub vault_id: String,

    /// Organization owning the serialization settings
    #[arg(long, default_value = "default", env = "VAULTSYNC_ORG_ID")]
    pub org_id: String,

    /// User id recorded as lock holder (defaults to the OS user)
    #[arg(long, env = "VAULTSYNC_USER")]
    pub user: Option<String>,

    /// Server backend: local (shared catalog directory) or rest
    #[arg(long, default_value = "local", env = "VAULTSYNC_BACKEND")]
    pub backend: BackendKind,

    /// Shared catalog directory (only used with --backend local)
    #[arg(long, env = "VAULTSYNC_CATALOG_DIR")]
    pub catalog_dir: Option<PathBuf>,

    /// API base URL (only used with --backend rest)
    #[arg(long, env = "VAULTSYNC_SERVER_URL")]
    pub server_url: Option<String>,

    /// API key (only used with --backend rest)
    #[arg(long, env = "VAULTSYNC_API_KEY")]
    pub api_key: Option<String>,

    /// User session token (only used with --backend rest)
    #[arg(long, env = "VAULTSYNC_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Storage bucket for file content (only used with --backend rest)
    #[arg(long, default_value = "vault-files", env = "VAULTSYNC_BUCKET")]
    pub bucket: String,

    /// Directory for persisted client state (baselines, believed locks, orphans)
    #[arg(long, env = "VAULTSYNC_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Glob patterns excluded from sync; repeatable
    #[arg(long = "ignore", env = "VAULTSYNC_IGNORE", value_delimiter = ',')]
    pub ignore: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "VAULTSYNC_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Get the effective user id.
    pub fn effective_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Get the effective shared catalog directory.
    pub fn effective_catalog_dir(&self) -> PathBuf {
        self.catalog_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("catalog"))
    }

    /// Get the effective state directory.
    pub fn effective_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| self.data_dir())
    }

    /// State file for this vault and user.
    pub fn state_file(&self) -> PathBuf {
        self.effective_state_dir()
            .join(format!("{}-{}.json", self.vault_id, self.effective_user()))
    }

    fn data_dir(&self) -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultsync")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    Local,
    Rest,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Rest => write!(f, "rest"),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List files with their diff status and lock holder
    Status {
        /// Include synced files
        #[arg(long)]
        all: bool,
    },
    /// Check out files (folders expand to the files below them)
    Checkout {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Check in files, uploading local changes
    Checkin {
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long, short)]
        message: Option<String>,
    },
    /// Release checkouts without a new version
    Undo {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Download server content for cloud, outdated or deleted files
    Download {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// First upload of local-only files
    Upload {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Move a file locally; the new path is published on checkin
    Rename { from: String, to: String },
    /// Delete local copies, or server records with --server
    Delete {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Delete from the server (and locally)
        #[arg(long)]
        server: bool,
        /// Confirm a server delete; without it the plan is only printed
        #[arg(long)]
        yes: bool,
    },
    /// Administrative checkin of a file checked out by anyone
    ForceCheckin { path: String },
    /// Compare believed checkouts with the server and record orphans
    Reconcile,
    /// List orphaned checkouts
    Orphans,
    /// Resolve orphaned checkouts
    Resolve {
        /// discard, re-checkout, backup-then-discard or upload-as-new
        action: ResolutionAction,
        /// File ids; all open orphans when omitted
        file_ids: Vec<String>,
    },
    /// Forget an orphaned checkout without touching the server
    Dismiss { file_id: String },
    /// Serial number allocation and settings
    Serial {
        #[command(subcommand)]
        command: SerialCommand,
    },
    /// Re-apply read-only bits from server lock state
    Repair,
    /// Watch the vault and reconcile periodically until interrupted
    Watch {
        /// Seconds between orphan reconciliation passes
        #[arg(long, default_value = "60")]
        reconcile_secs: u64,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SerialCommand {
    /// Print the organization's settings as JSON
    Show,
    /// Save settings from a JSON file; the stored counter is kept
    Save { path: PathBuf },
    /// Show the next number without allocating it
    Preview {
        #[arg(long)]
        tab: Option<u32>,
    },
    /// Allocate the next number
    Next {
        #[arg(long)]
        tab: Option<u32>,
        /// Only allocate if this file name has an auto-numbered extension
        #[arg(long)]
        file: Option<String>,
    },
    /// Find the highest number used by files in the vault
    Detect {
        /// Set the counter to the detected value
        #[arg(long)]
        apply: bool,
    },
    /// Set the counter explicitly
    Set { value: u64 },
}
