use thiserror::Error;

/// Errors that can occur in the sync and locking core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Checkout contention: someone else holds the lock.
    #[error("File is checked out by {holder}")]
    AlreadyLocked { holder: String },

    /// Checkin, rename or delete attempted without holding the lock.
    #[error("Not the lock owner: {0}")]
    NotOwner(String),

    /// Operation deferred behind an in-flight operation on overlapping paths.
    #[error("Path conflict: {0}")]
    PathConflict(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    /// A settings save would have overwritten a concurrently advanced counter.
    #[error("Stale serial counter: {0}")]
    StaleCounter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Whether the user may sensibly retry the step that produced this error.
    ///
    /// Nothing in the core retries automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Io(_) | VaultError::Network(_))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(VaultError::Network("timeout".into()).is_retryable());
        assert!(VaultError::Io("disk full".into()).is_retryable());
        assert!(!VaultError::NotOwner("a.sldprt".into()).is_retryable());
        assert!(!VaultError::AlreadyLocked { holder: "bob".into() }.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = VaultError::AlreadyLocked { holder: "bob".into() };
        assert_eq!(err.to_string(), "File is checked out by bob");
    }
}
