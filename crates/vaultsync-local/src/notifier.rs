use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use vaultsync_core::{Notifier, ToastKind};

/// Notifier for a terminal: toasts become log lines and Ctrl+C cancels the
/// running batch between files.
#[derive(Debug, Default)]
pub struct ConsoleNotifier {
    cancelled: AtomicBool,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancel on the first Ctrl+C. A batch finishes the file in progress,
    /// then stops.
    pub fn cancel_on_ctrl_c(self: &Arc<Self>) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, cancelling after the current file");
                notifier.cancel();
            }
        });
    }
}

impl Notifier for ConsoleNotifier {
    fn add_toast(&self, kind: ToastKind, message: &str) {
        match kind {
            ToastKind::Error => error!("{}", message),
            ToastKind::Warning => warn!("{}", message),
            ToastKind::Info | ToastKind::Success => info!("{}", message),
        }
    }

    fn add_progress_toast(&self, id: &str, label: &str, total: usize) {
        info!("[{}] {} (0/{})", id, label, total);
    }

    fn update_progress_toast(&self, id: &str, completed: usize, percent: u8, note: Option<&str>) {
        match note {
            Some(note) => info!("[{}] {}% ({} done) {}", id, percent, completed, note),
            None => info!("[{}] {}% ({} done)", id, percent, completed),
        }
    }

    fn remove_toast(&self, _id: &str) {}

    fn is_progress_toast_cancelled(&self, _id: &str) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_applies_to_every_toast() {
        let notifier = ConsoleNotifier::new();
        assert!(!notifier.is_progress_toast_cancelled("batch-1"));
        notifier.cancel();
        assert!(notifier.is_progress_toast_cancelled("batch-1"));
        assert!(notifier.is_progress_toast_cancelled("batch-2"));
    }
}
