use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    Info,
    Success,
    Warning,
    Error,
}

/// The toast and progress surface a UI provides.
///
/// Calls are fire-and-forget; the core never waits on rendering.
pub trait Notifier: Send + Sync {
    fn add_toast(&self, kind: ToastKind, message: &str);

    fn add_progress_toast(&self, id: &str, label: &str, total: usize);

    fn update_progress_toast(&self, id: &str, completed: usize, percent: u8, note: Option<&str>);

    fn remove_toast(&self, id: &str);

    /// Whether the user pressed cancel on a progress toast.
    fn is_progress_toast_cancelled(&self, id: &str) -> bool;
}

/// Discards everything and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn add_toast(&self, _kind: ToastKind, _message: &str) {}

    fn add_progress_toast(&self, _id: &str, _label: &str, _total: usize) {}

    fn update_progress_toast(&self, _id: &str, _completed: usize, _percent: u8, _note: Option<&str>) {}

    fn remove_toast(&self, _id: &str) {}

    fn is_progress_toast_cancelled(&self, _id: &str) -> bool {
        false
    }
}
