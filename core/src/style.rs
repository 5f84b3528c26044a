//! Terminal styling helpers.
//!
//! A process-wide switch controls whether emphasis is applied, so `--no-color`
//! can turn everything off before any output happens.

use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;

static COLOR_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all styling for the rest of the process.
pub fn disable_color() {
    COLOR_ENABLED.store(false, Ordering::Relaxed);
}

fn enabled() -> bool {
    COLOR_ENABLED.load(Ordering::Relaxed)
}

/// Emphasize an identifier (stack id, image reference) in user-facing output.
pub fn identifier(s: &str) -> String {
    if enabled() {
        s.bold().to_string()
    } else {
        s.to_string()
    }
}

/// Prefix for error lines.
pub fn error_prefix() -> String {
    if enabled() {
        "ERROR: ".red().bold().to_string()
    } else {
        "ERROR: ".to_string()
    }
}

/// Prefix for tip lines.
pub fn tip_prefix() -> String {
    if enabled() {
        "Tip: ".green().bold().to_string()
    } else {
        "Tip: ".to_string()
    }
}

/// Separator between a timestamp and the message body.
pub fn separator(s: &str) -> String {
    if enabled() {
        s.cyan().to_string()
    } else {
        s.to_string()
    }
}
