//! User-facing reporting.
//!
//! The [`Reporter`] is constructed once at process start and passed by
//! reference into the components that talk to the user (rebase engine, run
//! supervisor, CLI commands). Diagnostics go through `tracing`; the reporter
//! is only for lines a person is meant to read.

use crate::style;

/// Writes human-facing lines to stdout/stderr.
#[derive(Debug, Clone)]
pub struct Reporter {
    verbose: bool,
    timestamps: bool,
}

impl Reporter {
    pub fn new(verbose: bool, no_timestamps: bool) -> Self {
        Self {
            verbose,
            timestamps: !no_timestamps,
        }
    }

    fn prefix(&self) -> String {
        if self.timestamps {
            let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
            format!("{now} {}", style::separator("| "))
        } else {
            String::new()
        }
    }

    /// Informational line on stdout.
    pub fn info(&self, message: impl AsRef<str>) {
        println!("{}{}", self.prefix(), message.as_ref());
    }

    /// Verbose-only line on stdout.
    pub fn debug(&self, message: impl AsRef<str>) {
        if self.verbose {
            println!("{}{}", self.prefix(), message.as_ref());
        }
    }

    /// Error line on stderr.
    pub fn error(&self, message: impl AsRef<str>) {
        eprintln!("{}{}{}", self.prefix(), style::error_prefix(), message.as_ref());
    }

    /// Tip line on stdout.
    pub fn tip(&self, message: impl AsRef<str>) {
        println!("{}{}{}", self.prefix(), style::tip_prefix(), message.as_ref());
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new(true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_empty_without_timestamps() {
        let reporter = Reporter::new(true, true);
        assert!(reporter.prefix().is_empty());
    }

    #[test]
    fn test_prefix_present_with_timestamps() {
        let reporter = Reporter::new(true, false);
        assert!(!reporter.prefix().is_empty());
    }
}
