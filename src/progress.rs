//! Terminal progress bar for batch commands

use flowkeeper_runtime::ProgressSink;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}";

/// Progress sink drawing an indicatif bar on stderr
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    /// Visible bar; indicatif skips drawing when stderr is not a terminal
    pub fn new(total: usize, message: &str) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_bar().template(TEMPLATE) {
            bar.set_style(style.progress_chars("##-"));
        }
        bar.set_message(message.to_string());
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, completed: usize, total: usize, label: &str) {
        if self.bar.length() != Some(total as u64) {
            self.bar.set_length(total as u64);
            self.bar.set_message(label.to_string());
        }
        self.bar.set_position(completed as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_tracks_position() {
        let progress = BarProgress::hidden();
        progress.report(3, 10, "validate");
        assert_eq!(progress.position(), 3);
        progress.finish();
    }
}
