//! Raw Btrfs ioctl numbers and `#[repr(C)]` structs mirroring the kernel
//! ABI (`linux/btrfs.h`, `linux/fs.h`). `libc` ships none of these — Btrfs
//! is not part of its portable surface — so they're hand-encoded here the
//! same way `fdisk/src/disk.rs` hand-encodes `BLKGETSIZE64` with its `ior!`
//! macro.

#![allow(dead_code)]

pub const BTRFS_IOCTL_MAGIC: u8 = 0x94;

/// Object id of a subvolume's own root directory; also the kernel's "first
/// free object id" constant, used as the sentinel for "is this a subvolume".
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
/// Tree id of the filesystem-wide root tree (holds `ROOT_ITEM`s for every
/// subvolume).
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;

pub const BTRFS_INODE_ITEM_KEY: u32 = 1;
pub const BTRFS_ROOT_ITEM_KEY: u32 = 132;

pub const FS_IMMUTABLE_FL: libc::c_long = 0x00000010;

// -- ioctl number encoding (matches <asm-generic/ioctl.h>) ------------------

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u64 {
    ((dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as u64
}

pub const fn ior(ty: u8, nr: u8, size: usize) -> u64 {
    ioc(IOC_READ, ty, nr, size)
}
pub const fn iow(ty: u8, nr: u8, size: usize) -> u64 {
    ioc(IOC_WRITE, ty, nr, size)
}
pub const fn iowr(ty: u8, nr: u8, size: usize) -> u64 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

// -- Tree search -------------------------------------------------------------

pub const SEARCH_ARGS_BUFSIZE: usize = 4096 - std::mem::size_of::<BtrfsIoctlSearchKey>();

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BtrfsIoctlSearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    pub unused: u32,
    pub unused1: u64,
    pub unused2: u64,
    pub unused3: u64,
    pub unused4: u64,
}

#[repr(C)]
pub struct BtrfsIoctlSearchArgs {
    pub key: BtrfsIoctlSearchKey,
    pub buf: [u8; SEARCH_ARGS_BUFSIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BtrfsIoctlSearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

pub fn ioc_tree_search() -> u64 {
    iowr(BTRFS_IOCTL_MAGIC, 17, std::mem::size_of::<BtrfsIoctlSearchArgs>())
}

// -- inode item payload (as returned embedded after a search header) --------

/// Matches `struct btrfs_inode_item` up through the fields this crate reads.
/// The kernel struct has more trailing fields (uid, gid, mode, ...); we read
/// them at fixed byte offsets instead of modeling the whole struct, since
/// we never need to round-trip it.
pub mod inode_item {
    pub const GENERATION_OFFSET: usize = 0;
    pub const SIZE_OFFSET: usize = 16;
    pub const MODE_OFFSET: usize = 116;
    pub const LEN: usize = 160;
}

pub mod root_item {
    /// `generation` sits immediately after the embedded `btrfs_inode_item`.
    pub const GENERATION_OFFSET: usize = super::inode_item::LEN;
}

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;

// -- ino -> path --------------------------------------------------------------

pub const INO_PATH_BUFSIZE: usize = 4080;

#[repr(C)]
pub struct BtrfsIoctlInoPathArgs {
    pub inum: u64,
    pub size: u64,
    pub reserved: [u64; 4],
    pub fspath: u64, // pointer-sized field; filled in with `buf`'s address
}

pub fn ioc_ino_paths() -> u64 {
    iowr(BTRFS_IOCTL_MAGIC, 35, std::mem::size_of::<BtrfsIoctlInoPathArgs>())
}

#[repr(C)]
pub struct BtrfsIoctlPathLinkHeader {
    pub name_len: u64,
}

// -- ino -> root id -----------------------------------------------------------

pub const INO_LOOKUP_PATH_MAX: usize = 4080;

#[repr(C)]
pub struct BtrfsIoctlInoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; INO_LOOKUP_PATH_MAX],
}

pub fn ioc_ino_lookup() -> u64 {
    iowr(BTRFS_IOCTL_MAGIC, 18, std::mem::size_of::<BtrfsIoctlInoLookupArgs>())
}

// -- fs info (fsid) -----------------------------------------------------------

#[repr(C)]
pub struct BtrfsIoctlFsInfoArgs {
    pub max_id: u64,
    pub num_devices: u64,
    pub fsid: [u8; 16],
    pub reserved: [u64; 124],
}

pub fn ioc_fs_info() -> u64 {
    ior(BTRFS_IOCTL_MAGIC, 31, std::mem::size_of::<BtrfsIoctlFsInfoArgs>())
}

// -- extent clone / "dedupe range" --------------------------------------------

pub const SAME_DATA_DIFFERS: i32 = 1;

#[repr(C)]
pub struct BtrfsIoctlSameExtentInfo {
    pub fd: i64,
    pub logical_offset: u64,
    pub bytes_deduped: u64,
    pub status: i32,
    pub reserved: u32,
}

#[repr(C)]
pub struct BtrfsIoctlSameArgs {
    pub logical_offset: u64,
    pub length: u64,
    pub dest_count: u16,
    pub reserved1: u16,
    pub reserved2: u32,
    pub info: [BtrfsIoctlSameExtentInfo; 1],
}

pub fn ioc_file_extent_same() -> u64 {
    iowr(BTRFS_IOCTL_MAGIC, 54, std::mem::size_of::<BtrfsIoctlSameArgs>())
}

// -- immutable flag (generic fs ioctl, not btrfs-specific) --------------------

pub fn fs_ioc_getflags() -> u64 {
    ior(b'f', 1, std::mem::size_of::<libc::c_long>())
}
pub fn fs_ioc_setflags() -> u64 {
    iow(b'f', 2, std::mem::size_of::<libc::c_long>())
}

// -- file leases, used to probe for another process holding a file open
// for writing (`linux/fcntl.h`; not all exposed by `libc` on every target).

pub const F_SETLEASE: libc::c_int = 1024;
pub const F_WRLCK: libc::c_int = 1;
pub const F_UNLCK: libc::c_int = 2;

// -- fiemap (physical extent map), used by the hasher's layout signature ----

pub const FIEMAP_MAX_OFFSET: u64 = u64::MAX;
pub const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
/// How many extents we're willing to pull per call. The layout signature
/// only needs to distinguish different extent maps from each other, not
/// describe arbitrarily fragmented files exactly, so this is a budget, not
/// a correctness requirement.
pub const FIEMAP_EXTENT_BUDGET: usize = 32;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FiemapExtent {
    pub fe_logical: u64,
    pub fe_physical: u64,
    pub fe_length: u64,
    pub fe_reserved64: [u64; 2],
    pub fe_flags: u32,
    pub fe_reserved: [u32; 3],
}

#[repr(C)]
pub struct Fiemap {
    pub fm_start: u64,
    pub fm_length: u64,
    pub fm_flags: u32,
    pub fm_mapped_extents: u32,
    pub fm_extent_count: u32,
    pub fm_reserved: u32,
    pub fm_extents: [FiemapExtent; FIEMAP_EXTENT_BUDGET],
}

pub fn ioc_fiemap() -> u64 {
    iowr(b'f', 11, std::mem::size_of::<Fiemap>())
}
