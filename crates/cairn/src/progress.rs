//! Progress reporting for long operations.

use std::io::Write;

/// Prints percent progress to stderr, rbd-style, unless disabled.
pub struct Progress {
    label: &'static str,
    total: u64,
    done: u64,
    last_percent: i64,
    enabled: bool,
}

impl Progress {
    /// Creates a reporter for `total` units of work.
    pub fn new(label: &'static str, total: u64, enabled: bool) -> Self {
        Self { label, total, done: 0, last_percent: -1, enabled }
    }

    /// Advances progress by `units`.
    pub fn advance(&mut self, units: u64) {
        self.done += units;
        if !self.enabled || self.total == 0 {
            return;
        }
        let percent = (self.done.min(self.total) * 100 / self.total) as i64;
        if percent != self.last_percent {
            self.last_percent = percent;
            eprint!("\r{}: {percent}% complete...", self.label);
            let _ = std::io::stderr().flush();
        }
    }

    /// Finishes the progress line.
    pub fn done(mut self) {
        if self.enabled {
            self.advance(self.total.saturating_sub(self.done));
            eprintln!("\r{}: 100% complete...done.", self.label);
        }
    }
}
