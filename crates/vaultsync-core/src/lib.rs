//! Core types, rules and collaborator traits for the vaultsync PDM client.
//!
//! This crate defines what is shared between the engine and its backends:
//! - `FileRecord` and `DiffStatus`: local/server pairing and classification
//! - `VaultBackend`: catalog, conditional lock, blob store and counter primitives
//! - `LocalFileSystem`: the desktop shell's disk operations
//! - `Notifier`: toast and progress surface
//! - Serial number formatting, keepout zones and orphan detection
//!
//! Everything outside the traits is pure and synchronous.

mod backend;
pub mod diff;
mod error;
mod filesystem;
mod notify;
pub mod orphan;
pub mod paths;
mod record;
pub mod rules;
pub mod serial;

pub use backend::{
    ActivityAction, ActivityRecord, CheckinRequest, CheckoutOutcome, NewFile, VaultBackend,
};
pub use diff::{classify, pair_entries, IgnoreRules};
pub use error::{Result, VaultError};
pub use filesystem::LocalFileSystem;
pub use notify::{Notifier, SilentNotifier, ToastKind};
pub use orphan::{BelievedLock, LockCheck, OrphanedCheckout, ResolutionAction};
pub use record::{DiffStatus, FileRecord, LocalEntry, LockState, ServerRecord, SyncBaseline};
pub use rules::{Affordances, Blocked};
pub use serial::{KeepoutZone, SerializationSettings};
