//! Progress reporting and cooperative cancellation for long-running builds.

use tracing::info;

/// Receives progress from index builds.
///
/// Setting `*cancel` to true asks the build to stop at its next check.
pub trait ProgressSink {
    fn update_progress(&mut self, current: u64, total: u64, cancel: &mut bool);
}

impl<F> ProgressSink for F
where
    F: FnMut(u64, u64, &mut bool),
{
    fn update_progress(&mut self, current: u64, total: u64, cancel: &mut bool) {
        self(current, total, cancel)
    }
}

/// Ignores progress and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update_progress(&mut self, _current: u64, _total: u64, _cancel: &mut bool) {}
}

/// Logs progress through `tracing` at info level.
#[derive(Debug, Clone)]
pub struct LogProgress {
    label: String,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressSink for LogProgress {
    fn update_progress(&mut self, current: u64, total: u64, _cancel: &mut bool) {
        if total > 0 {
            let percent = current as f64 * 100.0 / total as f64;
            info!(job = %self.label, current, total, "progress {:.1}%", percent);
        } else {
            info!(job = %self.label, current, "progress");
        }
    }
}

/// Requests cancellation on the n-th update.
#[derive(Debug, Clone)]
pub struct CancelAfter {
    remaining: u64,
    updates: u64,
}

impl CancelAfter {
    pub fn new(updates: u64) -> Self {
        Self {
            remaining: updates,
            updates: 0,
        }
    }

    /// Updates received so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl ProgressSink for CancelAfter {
    fn update_progress(&mut self, _current: u64, _total: u64, cancel: &mut bool) {
        self.updates += 1;
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            *cancel = true;
        }
    }
}
