//! Progress reporting (`spec.md` §4.7): decouples the pipeline from any
//! particular output sink, in the spirit of the teacher's own `Logger` —
//! a small trait the rest of the code calls unconditionally, with the
//! actual verbosity gate living in the one implementation that prints.

use std::io::Write;

/// Sink for progress during a scan or dedup run. `notify` is for one-line
/// events (volume started, generation skipped, inode vanished); `update`
/// is for a high-frequency current-item indicator (the path currently
/// being hashed or cloned) that an interactive sink may overwrite in
/// place rather than appending a new line per call.
pub trait ProgressSink {
    fn notify(&mut self, message: &str);
    fn update(&mut self, label: &str, value: &str);
}

/// Discards everything. Used by library callers and tests that don't care.
#[derive(Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn notify(&mut self, _message: &str) {}
    fn update(&mut self, _label: &str, _value: &str) {}
}

/// Writes to stderr, gated by a verbosity level set from `-v`/`-q` flags.
pub struct StderrProgressSink {
    verbosity: i32,
}

impl StderrProgressSink {
    pub fn new(verbosity: i32) -> Self {
        Self { verbosity }
    }
}

impl ProgressSink for StderrProgressSink {
    fn notify(&mut self, message: &str) {
        if self.verbosity >= 0 {
            eprintln!("{}", message);
        }
    }

    fn update(&mut self, label: &str, value: &str) {
        if self.verbosity >= 1 {
            eprint!("\r{}: {}\x1b[K", label, value);
            let _ = std::io::stderr().flush();
        }
    }
}
