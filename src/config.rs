//! Configuration recognized by the pipeline (`spec.md` §6). CLI parsing that
//! produces these values is out of scope here; only the values themselves
//! and their defaults live in this crate.

/// Per-volume options.
#[derive(Clone, Copy, Debug)]
pub struct VolumeConfig {
    /// Minimum file size considered for deduplication, in bytes. Files
    /// below this are ignored and expunged from the catalog. Shrinking this
    /// value forces a full rescan on the next run (`scanner::min_generation`).
    pub size_cutoff: u64,
}

/// 8 MiB, matching the value the original tool converged on after a few
/// rounds of tuning (smaller cutoffs scan longer but find more duplicates).
pub const DEFAULT_SIZE_CUTOFF: u64 = 8 * 1024 * 1024;

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            size_cutoff: DEFAULT_SIZE_CUTOFF,
        }
    }
}

/// Global, process-wide tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct GlobalConfig {
    /// Window size for materializing a size-group's candidate membership,
    /// bounding the working set kept in memory at once.
    pub window_size: usize,
    /// Buffer size used when streaming a file for hashing.
    pub bufsize: usize,
}

pub const DEFAULT_WINDOW_SIZE: usize = 1024;
pub const DEFAULT_BUFSIZE: usize = 8192;

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            bufsize: DEFAULT_BUFSIZE,
        }
    }
}
