//! Plain data structs for the catalog entities (`spec.md` §3). These carry
//! no behavior of their own beyond small helpers; persistence lives in
//! `catalog`, filesystem access lives in `fsprimitives`.

use std::fs::File;
use uuid::Uuid;

/// A Btrfs filesystem, identified by its opaque UUID.
#[derive(Clone, Debug)]
pub struct Filesystem {
    pub id: i64,
    pub uuid: Uuid,
}

/// A subvolume within a `Filesystem`.
///
/// Only the fields up to `last_tracked_size_cutoff` are persisted; the rest
/// is attached at runtime by whoever opened the volume and is never written
/// to the catalog.
#[derive(Debug)]
pub struct Volume {
    pub id: i64,
    pub fs_id: i64,
    pub root_id: u64,
    pub size_cutoff: u64,
    pub last_tracked_generation: u64,
    pub last_tracked_size_cutoff: Option<u64>,

    /// Transient: attached when the volume is opened for a run.
    pub handle: Option<VolumeHandle>,
}

impl Volume {
    /// Returns the open directory descriptor, panicking if the volume
    /// hasn't been opened. Every call site in the pipeline only sees a
    /// `Volume` after `Orchestrator` has attached a handle.
    pub fn fd(&self) -> &File {
        &self.handle.as_ref().expect("volume handle not attached").dir
    }

    pub fn st_dev(&self) -> u64 {
        self.handle.as_ref().expect("volume handle not attached").st_dev
    }
}

/// Runtime-only state for an open `Volume`: directory descriptor, device
/// id (for race detection against `fstat`), and a human-readable path used
/// only for logging.
#[derive(Debug)]
pub struct VolumeHandle {
    pub dir: File,
    pub st_dev: u64,
    pub desc: String,
}

/// An observed mount path for a volume. Append-only.
#[derive(Clone, Debug)]
pub struct VolumePathHistory {
    pub vol_id: i64,
    pub path: String,
}

/// A tracked inode on a volume.
///
/// Uniquely keyed by `(vol_id, ino)`. There is intentionally no foreign key
/// from `DedupEvent`/`DedupEventInode` to this entity: inode numbers are
/// recycled by the filesystem, so a logging row can outlive (or predate)
/// the `Inode` row it was about.
#[derive(Clone, Debug)]
pub struct Inode {
    pub vol_id: i64,
    pub ino: u64,
    pub size: u64,
    pub has_updates: bool,
    pub mini_hash: Option<Vec<u8>>,
    pub fiemap_hash: Option<Vec<u8>>,
}

/// One audit record: `count` inodes across `fs_id` were observed sharing
/// `item_size` bytes of content at `created`. Append-only; never implies
/// the inodes still share content.
#[derive(Clone, Debug)]
pub struct DedupEvent {
    pub id: i64,
    pub fs_id: i64,
    pub item_size: u64,
    /// Unix seconds, UTC.
    pub created: i64,
}

/// One inode that participated in a `DedupEvent` (the source, or a
/// successfully cloned destination).
#[derive(Clone, Debug)]
pub struct DedupEventInode {
    pub id: i64,
    pub event_id: i64,
    pub ino: u64,
    pub vol_id: i64,
}

/// A group of inodes sharing a size, as produced by `grouper`.
#[derive(Debug)]
pub struct SizeGroup {
    pub size: u64,
    pub inodes: Vec<Inode>,
}
