//! User-facing progress reporting.
//!
//! External tools report progress as free text. [`ProgressReporter`] pulls
//! percentages out of that text and keeps a single status line up to date
//! through the [`Ui`] trait. Diagnostic logging goes through `tracing`
//! instead and never touches this line.

use std::sync::LazyLock;

use regex::Regex;

/// Matches a decimal percentage such as `40%`.
static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Safety: this is a compile-time constant pattern, so it cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(r"(\d+)%").expect("valid regex")
});

/// Matches the first run of digits in a chunk.
static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\d+").expect("valid regex")
});

/// Sink for user-visible output.
pub trait Ui {
    /// Print a persistent informational line.
    fn info(&self, message: &str);

    /// Print a persistent error-styled line.
    fn error(&self, message: &str);

    /// Replace the live status line with `message`.
    fn progress(&self, message: &str);

    /// Remove the live status line.
    fn clear_line(&self);
}

/// Extract the most recent `N%` token from a chunk, without the `%`.
///
/// Export tools often batch several ticks into one write (`"10%...20%"`);
/// the last one is the current value.
pub fn parse_percent(text: &str) -> Option<&str> {
    PERCENT_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Extract the first run of digits from a chunk.
pub fn parse_digits(text: &str) -> Option<&str> {
    DIGITS_RE.find(text).map(|m| m.as_str())
}

/// Renders percentages to the status line, skipping repeats.
///
/// Dropping the reporter clears the status line.
pub struct ProgressReporter<'a> {
    ui: &'a dyn Ui,
    label: String,
    last: Option<String>,
}

impl<'a> ProgressReporter<'a> {
    /// Create a reporter whose lines read `"{label}: N%"`.
    pub fn new(ui: &'a dyn Ui, label: impl Into<String>) -> Self {
        Self {
            ui,
            label: label.into(),
            last: None,
        }
    }

    /// Show `percent` unless it is already on screen.
    pub fn render(&mut self, percent: &str) {
        if self.last.as_deref() == Some(percent) {
            return;
        }
        self.ui.progress(&format!("{}: {}%", self.label, percent));
        self.last = Some(percent.to_string());
    }

    /// The last percentage shown, if any.
    pub fn last_rendered(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Clear the status line.
    pub fn clear(&mut self) {
        self.ui.clear_line();
        self.last = None;
    }
}

impl Drop for ProgressReporter<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}
