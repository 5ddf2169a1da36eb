//! The error taxonomy for the dedup pipeline (`spec.md` §7). Of that
//! section's seven kinds, `StaleInode`, `Busy`, `Raced` and `QuotaExceeded`
//! are recoverable *at the call site* — the scanner, hasher and cloner
//! delete the stale catalog row or reassert `has_updates` directly, inline,
//! rather than constructing and propagating a Rust error for someone else
//! to catch. Only the three fatal kinds ever leave a stage as a `DedupError`
//! for `main` to report: `HashCollision`, `Io`, and `ScanInterrupted`.

use thiserror::Error;

/// A fatal error from one stage of the dedup pipeline. Construction always
/// means the run aborts; recoverable outcomes (defer, delete) never reach
/// this type.
#[derive(Debug, Error)]
pub enum DedupError {
    /// Two files hashed identically but differed byte-for-byte. This can
    /// only mean a hash collision or a logic bug; the run aborts.
    #[error("hash collision (or bug): {a} and {b} hashed equal but differ")]
    HashCollision { a: String, b: String },

    /// Unexpected syscall or I/O failure, with context for the user.
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The tree-search ioctl failed mid-scan; the scan aborts without
    /// advancing the generation cursor.
    #[error("scan interrupted: {0}")]
    ScanInterrupted(String),

    /// The catalog itself failed (opaque to the rest of the pipeline).
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),
}

impl DedupError {
    /// Wraps a plain I/O error with context describing what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DedupError>;
