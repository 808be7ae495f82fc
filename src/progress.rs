//! Progress bar helpers.
//!
//! Bars draw to stderr next to the log output. They are hidden in log-only
//! mode and whenever the operator is being prompted on the terminal.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

// Set once from the command line before any bar is created
static BARS_HIDDEN: AtomicBool = AtomicBool::new(false);

pub fn set_log_only(value: bool) {
    BARS_HIDDEN.store(value, Ordering::Relaxed);
}

fn bars_hidden() -> bool {
    BARS_HIDDEN.load(Ordering::Relaxed)
}

/// Bar over a known number of tracks. `hidden` forces it off, e.g. while prompting.
pub fn create_progress_bar(len: u64, msg: &str, hidden: bool) -> ProgressBar {
    let pb = ProgressBar::new(len);
    if hidden || bars_hidden() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} (ETA: {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
    }
    pb.set_message(msg.to_string());
    pb
}

/// Spinner for history pages, whose total is only known after the first fetch.
pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if bars_hidden() {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{msg} {spinner} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
    }
    pb.set_message(msg.to_string());
    pb
}

/// Log progress every `interval` steps when bars are hidden.
pub fn log_progress(phase: &str, current: u64, total: u64, interval: u64) {
    if bars_hidden() && total > 0 && (current % interval.max(1) == 0 || current == total) {
        let pct = 100.0 * current as f64 / total as f64;
        info!(phase, current, total, "{:.1}%", pct);
    }
}
