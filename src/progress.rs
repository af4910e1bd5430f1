//! Progress reporting infrastructure

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::borrow::Cow;

/// CLI progress report of ongoing operations
///
/// To avoid corrupted terminal output, you should not write anything to stdout
/// or stderr yourself as long as a report is being displayed. Please use logs
/// for debug messages.
#[derive(Clone, Debug, Default)]
pub struct ProgressReport(MultiProgress);
//
impl ProgressReport {
    /// Prepare to report progress on the cli
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress report that is never displayed
    #[cfg(test)]
    pub fn hidden() -> Self {
        Self(MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::hidden(),
        ))
    }

    /// Prepare to report on a new operation
    pub fn add(&self, what: impl Into<Cow<'static, str>>, work: Work) -> ProgressTracker {
        let (bar, style_trailer) = match work {
            Work::Steps(steps) => (
                ProgressBar::new(steps as u64),
                "{wide_bar} {pos}/{len} ({per_sec})",
            ),
            Work::Bytes(Some(bytes)) => (
                ProgressBar::new(bytes),
                "{wide_bar} {decimal_bytes}/{decimal_total_bytes} ({decimal_bytes_per_sec})",
            ),
            Work::Bytes(None) => (
                ProgressBar::new_spinner(),
                "{spinner} {decimal_bytes} ({decimal_bytes_per_sec})",
            ),
        };
        let bar = bar.with_prefix(what).with_style(
            ProgressStyle::with_template(&format!("{{prefix}} {style_trailer}"))
                .expect("all styles above should be valid indicatif styles"),
        );
        ProgressTracker {
            bar: self.0.add(bar),
            report: self.0.clone(),
        }
    }
}

/// Work whose progression can be tracked
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Work {
    /// Steps to be taken, with a precise count display
    Steps(usize),

    /// Bytes to be processed, if the total is known
    Bytes(Option<u64>),
}

/// Mechanism to track progress of a single operation
///
/// Call [`finish()`](Self::finish) once the operation is over.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    /// Progress bar for this specific operation
    bar: ProgressBar,

    /// Underlying process report
    report: MultiProgress,
}
//
impl ProgressTracker {
    /// Show that a certain amount of progress has been made
    pub fn make_progress(&self, progress: u64) {
        self.bar.inc(progress);
    }

    /// Amount of progress made so far
    #[cfg(test)]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Hide the progress bar, e.g. once the operation is over
    pub fn finish(&self) {
        self.bar.finish_and_clear();
        self.report.remove(&self.bar);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_progress() {
        let report = ProgressReport::hidden();
        let steps = report.add("Counting", Work::Steps(3));
        steps.make_progress(1);
        steps.clone().make_progress(2);
        assert_eq!(steps.position(), 3);
        steps.finish();

        let bytes = report.add("Downloading", Work::Bytes(None));
        bytes.make_progress(1024);
        assert_eq!(bytes.position(), 1024);
    }
}
