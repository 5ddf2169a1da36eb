//! The filesystem-primitives capability (`spec.md` §4.1): a thin façade over
//! the Btrfs ioctls, modeled as a trait so the rest of the pipeline
//! (`scanner`, `grouper`, `hasher`, `cloner`) can run against a fake in
//! tests without a real Btrfs mount. `linux::LinuxFs` is the only
//! production implementation.

use std::collections::HashSet;
use std::fs::File;
use std::io::Result;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use uuid::Uuid;

pub mod ioctl;
pub mod linux;

#[cfg(test)]
pub mod fake;

pub use linux::LinuxFs;

/// One key tuple consumed/produced by `tree_search`. Mirrors the kernel's
/// `(objectid, type, offset, transid)`, with `tree_id` fixed per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchKey {
    pub objectid: u64,
    pub item_type: u32,
    pub offset: u64,
    pub transid: u64,
}

/// One decoded item returned by `tree_search`: the header tuple plus its
/// raw payload bytes.
#[derive(Clone, Debug)]
pub struct SearchItem {
    pub objectid: u64,
    pub item_type: u32,
    pub offset: u64,
    pub transid: u64,
    pub payload: Vec<u8>,
}

pub trait FsPrimitives {
    /// The filesystem-wide UUID.
    fn fsid(&self, vol_fd: &File) -> Result<Uuid>;
    /// The subvolume's own root (tree) id.
    fn root_id(&self, vol_fd: &File) -> Result<u64>;
    /// The subvolume's current generation (transaction counter).
    fn root_generation(&self, vol_fd: &File) -> Result<u64>;
    /// Whether `fd`'s root directory is itself a subvolume.
    fn is_subvolume(&self, fd: &File) -> Result<bool>;

    /// Runs one batch of the tree-search ioctl over `tree_id`, starting at
    /// `min_key` (inclusive) up to `max_key` (inclusive), requesting up to
    /// `nr_items` items. Returns the decoded items in kernel order; the
    /// caller advances its own cursor from the last item returned.
    fn tree_search(
        &self,
        vol_fd: &File,
        tree_id: u64,
        min_key: SearchKey,
        max_key: SearchKey,
        nr_items: u32,
    ) -> Result<Vec<SearchItem>>;

    /// Resolves an inode number to one path relative to the subvolume root.
    fn lookup_ino_path_one(&self, vol_fd: &File, ino: u64) -> Result<PathBuf>;

    fn open_readonly(&self, vol_fd: &File, path: &Path) -> Result<File>;
    fn open_readwrite(&self, vol_fd: &File, path: &Path) -> Result<File>;

    /// Returns `(physical_offset, length)` for each mapped extent backing
    /// `file`, in logical order, up to an implementation-defined budget.
    /// Used by the hasher's layout signature; never reads file content.
    fn file_extents(&self, file: &File) -> Result<Vec<(u64, u64)>>;

    /// Asks the kernel to replace `dest`'s extents with references to
    /// `src`'s. Returns `false` if the kernel reports the extents were
    /// already shared (a no-op), `true` on an actual clone.
    fn clone_data(&self, dest: &File, src: &File, check_first: bool) -> Result<bool>;

    /// Byte-for-byte comparison, independent of either file's current seek
    /// position.
    fn compare_files(&self, a: &File, b: &File) -> Result<bool>;

    /// Sets or clears the immutable attribute, returning the previous state.
    fn set_immutable(&self, fd: &File, on: bool) -> Result<bool>;

    /// Returns the subset of `fds` currently held open for writing by some
    /// other process.
    fn fds_in_write_use(&self, fds: &[RawFd]) -> Result<HashSet<RawFd>>;
}
