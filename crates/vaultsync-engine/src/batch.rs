//! Multi-file commands with partial-failure semantics.
//!
//! Items run one after another. A failing item is counted and the loop moves
//! on; cancellation is checked between items only, so a started item always
//! finishes. The caller gets one summary toast, never one per file.

use std::future::Future;

use tracing::{debug, warn};
use uuid::Uuid;
use vaultsync_core::{Notifier, ToastKind, VaultError};

/// Aggregate result of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, VaultError)>,
    /// Items never started because the user cancelled
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    /// E.g. `"Checked out 4/5 files"`, with failure and cancel notes.
    pub fn summary(&self, verb: &str) -> String {
        let total = self.total();
        let noun = if total == 1 { "file" } else { "files" };
        let mut message = format!("{} {}/{} {}", verb, self.succeeded.len(), total, noun);
        if !self.failed.is_empty() {
            message.push_str(&format!(", {} failed", self.failed.len()));
        }
        if self.cancelled {
            message.push_str(" (cancelled)");
        }
        message
    }

    fn toast_kind(&self) -> ToastKind {
        if self.succeeded.is_empty() && !self.failed.is_empty() {
            ToastKind::Error
        } else if !self.failed.is_empty() || self.cancelled {
            ToastKind::Warning
        } else {
            ToastKind::Success
        }
    }
}

/// Run `op` over `items` with a progress toast and a summary toast.
///
/// `key` names an item in the outcome and in failure logs.
pub async fn run_batch<T, K, F, Fut>(
    notifier: &dyn Notifier,
    verb: &str,
    items: Vec<T>,
    key: K,
    mut op: F,
) -> BatchOutcome
where
    K: Fn(&T) -> String,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), VaultError>>,
{
    let toast_id = format!("batch-{}", Uuid::new_v4());
    let total = items.len();
    notifier.add_progress_toast(&toast_id, verb, total);

    let mut outcome = BatchOutcome::default();
    let mut items = items.into_iter();
    while let Some(item) = items.next() {
        if notifier.is_progress_toast_cancelled(&toast_id) {
            debug!("{} cancelled after {} items", verb, outcome.succeeded.len() + outcome.failed.len());
            outcome.cancelled = true;
            outcome.skipped.push(key(&item));
            outcome.skipped.extend(items.by_ref().map(|i| key(&i)));
            break;
        }

        let name = key(&item);
        match op(item).await {
            Ok(()) => outcome.succeeded.push(name.clone()),
            Err(e) => {
                warn!("{} failed for {}: {}", verb, name, e);
                outcome.failed.push((name.clone(), e));
            }
        }

        let done = outcome.succeeded.len() + outcome.failed.len();
        let percent = if total == 0 { 100 } else { (done * 100 / total) as u8 };
        notifier.update_progress_toast(&toast_id, done, percent, Some(&name));
    }

    notifier.remove_toast(&toast_id);
    notifier.add_toast(outcome.toast_kind(), &outcome.summary(verb));
    outcome
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use vaultsync_core::{Notifier, ToastKind};

    /// Records toasts; cancels once `cancel_after` progress updates arrived.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub toasts: Mutex<Vec<(ToastKind, String)>>,
        pub updates: AtomicUsize,
        pub cancel_after: Option<usize>,
    }

    impl RecordingNotifier {
        pub fn messages(&self) -> Vec<String> {
            self.toasts.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn add_toast(&self, kind: ToastKind, message: &str) {
            self.toasts.lock().unwrap().push((kind, message.to_string()));
        }

        fn add_progress_toast(&self, _id: &str, _label: &str, _total: usize) {}

        fn update_progress_toast(&self, _id: &str, _completed: usize, _percent: u8, _note: Option<&str>) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn remove_toast(&self, _id: &str) {}

        fn is_progress_toast_cancelled(&self, _id: &str) -> bool {
            match self.cancel_after {
                Some(n) => self.updates.load(Ordering::SeqCst) >= n,
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingNotifier;
    use super::*;

    #[tokio::test]
    async fn test_failures_do_not_abort_batch() {
        let notifier = RecordingNotifier::default();
        let outcome = run_batch(
            &notifier,
            "Checked out",
            vec![1, 2, 3, 4, 5],
            |n| format!("f{}", n),
            |n| async move {
                if n == 3 {
                    Err(VaultError::Network("timeout".into()))
                } else {
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(outcome.succeeded.len(), 4);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "f3");
        assert_eq!(outcome.summary("Checked out"), "Checked out 4/5 files, 1 failed");
        let toasts = notifier.toasts.lock().unwrap();
        assert_eq!(toasts.len(), 1);
        assert_eq!(toasts[0].0, ToastKind::Warning);
    }

    #[tokio::test]
    async fn test_cancellation_between_items() {
        let notifier = RecordingNotifier {
            cancel_after: Some(2),
            ..Default::default()
        };
        let outcome = run_batch(
            &notifier,
            "Downloaded",
            vec!["a", "b", "c", "d"],
            |s| s.to_string(),
            |_| async { Ok(()) },
        )
        .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.succeeded, vec!["a", "b"]);
        assert_eq!(outcome.skipped, vec!["c", "d"]);
        assert_eq!(notifier.messages(), vec!["Downloaded 2/4 files (cancelled)"]);
    }

    #[test]
    fn test_summary_wording() {
        let outcome = BatchOutcome {
            succeeded: vec!["a".into()],
            ..Default::default()
        };
        assert_eq!(outcome.summary("Checked in"), "Checked in 1/1 file");
        assert!(outcome.is_complete_success());
    }
}
