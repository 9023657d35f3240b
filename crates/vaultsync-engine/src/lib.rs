//! Sync and checkout-locking engine for vaultsync.
//!
//! [`Vault`] is the entry point: it owns the [`FileStore`], admits commands
//! through the [`OperationQueue`] and drives the [`CheckoutManager`],
//! [`OrphanResolver`] and [`SerialCounter`] against a
//! [`VaultBackend`](vaultsync_core::VaultBackend) and a
//! [`LocalFileSystem`](vaultsync_core::LocalFileSystem).

mod batch;
mod context;
mod disk;
mod lock;
mod memory;
mod orphan;
mod queue;
mod repair;
mod serial;
mod store;
mod vault;

pub use batch::{run_batch, BatchOutcome};
pub use context::VaultContext;
pub use disk::{content_hash, LocalDisk};
pub use lock::{Checkout, CheckoutManager};
pub use memory::MemoryBackend;
pub use orphan::{OrphanResolver, ReconcileReport};
pub use queue::{OperationKind, OperationQueue, PendingOperation, QueuedOperation};
pub use repair::{repair_read_only, RepairReport};
pub use serial::SerialCounter;
pub use store::{FileStore, PersistedState, StoreEvent};
pub use vault::{DeletePlan, PlannedDelete, Vault, VaultOptions};
