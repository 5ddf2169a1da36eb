//! An in-memory `FsPrimitives` used only by this crate's own tests, so the
//! pipeline can be exercised without a real Btrfs mount. Real files live
//! under a `tempfile::TempDir`; everything Btrfs-specific (generations,
//! extent layout, the immutable flag, lease contention) is tracked in
//! plain Rust state the test sets up directly.

#![cfg(test)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use uuid::Uuid;

use super::ioctl::{BTRFS_INODE_ITEM_KEY, S_IFREG};
use super::{FsPrimitives, SearchItem, SearchKey};

#[derive(Clone, Debug)]
struct FakeInode {
    objectid: u64,
    generation: u64,
    size: u64,
    mode: u32,
    path: Option<String>,
}

pub struct FakeFs {
    dir: TempDir,
    fsid: Uuid,
    root_id: u64,
    root_generation: RefCell<u64>,
    inodes: RefCell<Vec<FakeInode>>,
    extents: RefCell<HashMap<u64, Vec<(u64, u64)>>>,
    immutable: RefCell<HashSet<u64>>,
    /// Inode numbers simulating "held open for write by another process",
    /// keyed by inode rather than fd number: the real write-lease probe is
    /// a per-inode property the kernel checks regardless of which fd to
    /// that inode you hold it on, and the candidate's own fd number isn't
    /// known to the test until `clone_candidates` opens it.
    busy_inodes: RefCell<HashSet<u64>>,
}

impl FakeFs {
    pub fn new(fsid: Uuid, root_id: u64) -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            fsid,
            root_id,
            root_generation: RefCell::new(0),
            inodes: RefCell::new(Vec::new()),
            extents: RefCell::new(HashMap::new()),
            immutable: RefCell::new(HashSet::new()),
            busy_inodes: RefCell::new(HashSet::new()),
        }
    }

    pub fn vol_dir(&self) -> File {
        File::open(self.dir.path()).unwrap()
    }

    pub fn vol_dir_path(&self) -> &Path {
        self.dir.path()
    }

    /// The real device id backing the tempdir, for tests that need a
    /// `VolumeHandle::st_dev` consistent with what `fstat` will report.
    pub fn dev(&self) -> u64 {
        fs::metadata(self.dir.path()).unwrap().dev()
    }

    pub fn set_root_generation(&self, gen: u64) {
        *self.root_generation.borrow_mut() = gen;
    }

    /// Writes `content` to `rel_path` (creating parent dirs), synthesizing
    /// a regular-file inode entry at `generation`/`size`. The tracked
    /// objectid is the file's real OS inode number, not a caller-chosen
    /// value — `fstat`-based race detection in `cloner` compares a
    /// candidate's tracked `ino` against `file.metadata()?.ino()`, and in
    /// production those are the same number (a btrfs tree-search objectid
    /// *is* the inode number), so the fake has to preserve that or every
    /// candidate would look raced. Returns the assigned inode number.
    pub fn put_file(&self, generation: u64, rel_path: &str, content: &[u8]) -> u64 {
        let full = self.dir.path().join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
        let objectid = fs::metadata(&full).unwrap().ino();
        self.inodes.borrow_mut().push(FakeInode {
            objectid,
            generation,
            size: content.len() as u64,
            mode: S_IFREG,
            path: Some(rel_path.to_string()),
        });
        objectid
    }

    /// The inode number `put_file` assigned to an already-written path.
    pub fn ino_of(&self, rel_path: &str) -> u64 {
        fs::metadata(self.dir.path().join(rel_path)).unwrap().ino()
    }

    /// Overwrites an already-`put_file`d path in place, bumping its tracked
    /// generation and size the way a real truncate/write would. Unlike
    /// `put_file`, this updates the existing entry rather than adding a
    /// second one for the same inode.
    pub fn rewrite_file(&self, rel_path: &str, generation: u64, content: &[u8]) {
        let full = self.dir.path().join(rel_path);
        fs::write(&full, content).unwrap();
        let ino = fs::metadata(&full).unwrap().ino();
        let mut inodes = self.inodes.borrow_mut();
        let entry = inodes
            .iter_mut()
            .find(|i| i.objectid == ino)
            .expect("rewrite_file: path was never put_file'd");
        entry.generation = generation;
        entry.size = content.len() as u64;
    }

    pub fn set_extents(&self, rel_path: &str, extents: Vec<(u64, u64)>) {
        let ino = fs::metadata(self.dir.path().join(rel_path)).unwrap().ino();
        self.extents.borrow_mut().insert(ino, extents);
    }

    /// Simulates an external process holding `rel_path` open for writing,
    /// so the next `fds_in_write_use` probe reports any descriptor on it
    /// as busy.
    pub fn mark_busy(&self, rel_path: &str) {
        let ino = fs::metadata(self.dir.path().join(rel_path)).unwrap().ino();
        self.busy_inodes.borrow_mut().insert(ino);
    }
}

impl FsPrimitives for FakeFs {
    fn fsid(&self, _vol_fd: &File) -> Result<Uuid> {
        Ok(self.fsid)
    }

    fn root_id(&self, _vol_fd: &File) -> Result<u64> {
        Ok(self.root_id)
    }

    fn root_generation(&self, _vol_fd: &File) -> Result<u64> {
        Ok(*self.root_generation.borrow())
    }

    fn is_subvolume(&self, _fd: &File) -> Result<bool> {
        Ok(true)
    }

    fn tree_search(
        &self,
        _vol_fd: &File,
        _tree_id: u64,
        min_key: SearchKey,
        max_key: SearchKey,
        nr_items: u32,
    ) -> Result<Vec<SearchItem>> {
        if min_key.item_type != BTRFS_INODE_ITEM_KEY && min_key.item_type != 0 {
            return Ok(Vec::new());
        }
        // Every fake item has key (objectid, INODE_ITEM_KEY, 0); compare
        // against the cursor lexicographically like the real kernel does,
        // not just by objectid, or the scanner's `(last.objectid,
        // last.type, last.offset + 1)` cursor advance would keep matching
        // the same last item forever.
        let item_key = |objectid: u64| (objectid, BTRFS_INODE_ITEM_KEY, 0u64);
        let min_tuple = (min_key.objectid, min_key.item_type.max(BTRFS_INODE_ITEM_KEY), min_key.offset);
        let max_tuple = (max_key.objectid, max_key.item_type, max_key.offset);
        let mut matches: Vec<FakeInode> = self
            .inodes
            .borrow()
            .iter()
            .filter(|i| {
                let key = item_key(i.objectid);
                key >= min_tuple && key <= max_tuple && i.generation >= min_key.transid
            })
            .cloned()
            .collect();
        matches.sort_by_key(|i| i.objectid);
        matches.truncate(nr_items as usize);

        Ok(matches
            .iter()
            .map(|i| {
                let mut payload = vec![0u8; super::ioctl::inode_item::LEN];
                payload[super::ioctl::inode_item::GENERATION_OFFSET..][..8]
                    .copy_from_slice(&i.generation.to_le_bytes());
                payload[super::ioctl::inode_item::SIZE_OFFSET..][..8]
                    .copy_from_slice(&i.size.to_le_bytes());
                payload[super::ioctl::inode_item::MODE_OFFSET..][..4]
                    .copy_from_slice(&i.mode.to_le_bytes());
                SearchItem {
                    objectid: i.objectid,
                    item_type: BTRFS_INODE_ITEM_KEY,
                    offset: 0,
                    transid: i.generation,
                    payload,
                }
            })
            .collect())
    }

    fn lookup_ino_path_one(&self, _vol_fd: &File, ino: u64) -> Result<PathBuf> {
        self.inodes
            .borrow()
            .iter()
            .find(|i| i.objectid == ino)
            .and_then(|i| i.path.clone())
            .map(PathBuf::from)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such fake inode"))
    }

    fn open_readonly(&self, _vol_fd: &File, path: &Path) -> Result<File> {
        OpenOptions::new().read(true).open(self.dir.path().join(path))
    }

    fn open_readwrite(&self, _vol_fd: &File, path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.dir.path().join(path))
    }

    fn file_extents(&self, file: &File) -> Result<Vec<(u64, u64)>> {
        let ino = file.metadata()?.ino();
        Ok(self.extents.borrow().get(&ino).cloned().unwrap_or_default())
    }

    fn clone_data(&self, dest: &File, src: &File, check_first: bool) -> Result<bool> {
        let src_bytes = {
            use std::io::Read;
            let mut f = src.try_clone()?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)?;
            buf
        };
        let dest_bytes_before = {
            use std::io::Read;
            let mut f = dest.try_clone()?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)?;
            buf
        };
        if dest_bytes_before != src_bytes {
            if check_first {
                return Ok(false);
            }
            return Err(Error::new(ErrorKind::InvalidData, "extents differ"));
        }

        let src_ino = src.metadata()?.ino();
        let dest_ino = dest.metadata()?.ino();
        let already_shared = {
            let extents = self.extents.borrow();
            match (extents.get(&src_ino), extents.get(&dest_ino)) {
                (Some(s), Some(d)) => s == d && !s.is_empty(),
                _ => false,
            }
        };
        if already_shared {
            return Ok(false);
        }
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = dest.try_clone()?;
            f.set_len(0)?;
            f.seek(SeekFrom::Start(0))?;
            f.write_all(&src_bytes)?;
        }
        if let Some(extents) = self.extents.borrow().get(&src_ino).cloned() {
            self.extents.borrow_mut().insert(dest_ino, extents);
        }
        Ok(true)
    }

    fn compare_files(&self, a: &File, b: &File) -> Result<bool> {
        use std::io::Read;
        let mut ba = Vec::new();
        let mut bb = Vec::new();
        a.try_clone()?.read_to_end(&mut ba)?;
        b.try_clone()?.read_to_end(&mut bb)?;
        Ok(ba == bb)
    }

    fn set_immutable(&self, fd: &File, on: bool) -> Result<bool> {
        let ino = fd.metadata()?.ino();
        let mut set = self.immutable.borrow_mut();
        let was = set.contains(&ino);
        if on {
            set.insert(ino);
        } else {
            set.remove(&ino);
        }
        Ok(was)
    }

    fn fds_in_write_use(&self, fds: &[RawFd]) -> Result<HashSet<RawFd>> {
        let busy = self.busy_inodes.borrow();
        let mut in_use = HashSet::new();
        for &fd in fds {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                return Err(Error::last_os_error());
            }
            if busy.contains(&st.st_ino) {
                in_use.insert(fd);
            }
        }
        Ok(in_use)
    }
}
