//! The Linux/Btrfs implementation of `FsPrimitives`.

use std::collections::HashSet;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{Error, Result};
use std::mem::{size_of, zeroed};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::ioctl::*;
use super::{FsPrimitives, SearchItem, SearchKey};

/// The production `FsPrimitives`, backed by real Btrfs ioctls.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxFs;

fn check(ret: libc::c_int) -> Result<()> {
    if ret < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

impl FsPrimitives for LinuxFs {
    fn fsid(&self, vol_fd: &File) -> Result<Uuid> {
        let mut args: BtrfsIoctlFsInfoArgs = unsafe { zeroed() };
        let ret = unsafe {
            libc::ioctl(vol_fd.as_raw_fd(), ioc_fs_info() as _, &mut args as *mut _)
        };
        check(ret)?;
        Ok(Uuid::from_bytes(args.fsid))
    }

    fn root_id(&self, vol_fd: &File) -> Result<u64> {
        let mut args: BtrfsIoctlInoLookupArgs = unsafe { zeroed() };
        args.objectid = BTRFS_FIRST_FREE_OBJECTID;
        let ret = unsafe {
            libc::ioctl(vol_fd.as_raw_fd(), ioc_ino_lookup() as _, &mut args as *mut _)
        };
        check(ret)?;
        Ok(args.treeid)
    }

    fn root_generation(&self, vol_fd: &File) -> Result<u64> {
        let root_id = self.root_id(vol_fd)?;
        let min_key = SearchKey {
            objectid: root_id,
            item_type: BTRFS_ROOT_ITEM_KEY,
            offset: 0,
            transid: 0,
        };
        let max_key = SearchKey {
            objectid: root_id,
            item_type: BTRFS_ROOT_ITEM_KEY,
            offset: u64::MAX,
            transid: u64::MAX,
        };
        let items = self.tree_search(vol_fd, BTRFS_ROOT_TREE_OBJECTID, min_key, max_key, 1)?;
        let item = items
            .into_iter()
            .find(|it| it.item_type == BTRFS_ROOT_ITEM_KEY && it.objectid == root_id)
            .ok_or_else(|| Error::new(std::io::ErrorKind::NotFound, "root item not found"))?;
        let off = root_item::GENERATION_OFFSET;
        if item.payload.len() < off + 8 {
            return Err(Error::new(std::io::ErrorKind::InvalidData, "short root item"));
        }
        let gen = u64::from_le_bytes(item.payload[off..off + 8].try_into().unwrap());
        Ok(gen)
    }

    fn is_subvolume(&self, fd: &File) -> Result<bool> {
        let mut st: libc::stat = unsafe { zeroed() };
        let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
        check(ret)?;
        Ok(st.st_ino == BTRFS_FIRST_FREE_OBJECTID)
    }

    fn tree_search(
        &self,
        vol_fd: &File,
        tree_id: u64,
        min_key: SearchKey,
        max_key: SearchKey,
        nr_items: u32,
    ) -> Result<Vec<SearchItem>> {
        let mut args: BtrfsIoctlSearchArgs = unsafe { zeroed() };
        args.key = BtrfsIoctlSearchKey {
            tree_id,
            min_objectid: min_key.objectid,
            max_objectid: max_key.objectid,
            min_offset: min_key.offset,
            max_offset: max_key.offset,
            min_transid: min_key.transid,
            max_transid: max_key.transid,
            min_type: min_key.item_type,
            max_type: max_key.item_type,
            nr_items,
            unused: 0,
            unused1: 0,
            unused2: 0,
            unused3: 0,
            unused4: 0,
        };

        let ret = unsafe {
            libc::ioctl(vol_fd.as_raw_fd(), ioc_tree_search() as _, &mut args as *mut _)
        };
        check(ret)?;

        let mut items = Vec::with_capacity(args.key.nr_items as usize);
        let mut offset = 0usize;
        let hdr_size = size_of::<BtrfsIoctlSearchHeader>();
        for _ in 0..args.key.nr_items {
            if offset + hdr_size > args.buf.len() {
                break;
            }
            let hdr = unsafe {
                &*(args.buf.as_ptr().add(offset) as *const BtrfsIoctlSearchHeader)
            };
            let payload_start = offset + hdr_size;
            let payload_end = payload_start + hdr.len as usize;
            if payload_end > args.buf.len() {
                break;
            }
            items.push(SearchItem {
                objectid: hdr.objectid,
                item_type: hdr.item_type,
                offset: hdr.offset,
                transid: hdr.transid,
                payload: args.buf[payload_start..payload_end].to_vec(),
            });
            offset = payload_end;
        }
        Ok(items)
    }

    fn lookup_ino_path_one(&self, vol_fd: &File, ino: u64) -> Result<PathBuf> {
        let mut buf = vec![0u8; INO_PATH_BUFSIZE];
        let mut args: BtrfsIoctlInoPathArgs = unsafe { zeroed() };
        args.inum = ino;
        args.size = buf.len() as u64;
        args.fspath = buf.as_mut_ptr() as u64;

        let ret = unsafe {
            libc::ioctl(vol_fd.as_raw_fd(), ioc_ino_paths() as _, &mut args as *mut _)
        };
        check(ret)?;

        let hdr_size = size_of::<BtrfsIoctlPathLinkHeader>();
        if buf.len() < hdr_size {
            return Err(Error::new(std::io::ErrorKind::NotFound, "inode has no path"));
        }
        let hdr = unsafe { &*(buf.as_ptr() as *const BtrfsIoctlPathLinkHeader) };
        let name_len = hdr.name_len as usize;
        if name_len == 0 || hdr_size + name_len > buf.len() {
            return Err(Error::new(std::io::ErrorKind::NotFound, "inode has no path"));
        }
        let name = &buf[hdr_size..hdr_size + name_len];
        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(name)))
    }

    fn open_readonly(&self, vol_fd: &File, path: &Path) -> Result<File> {
        openat(vol_fd, path, libc::O_RDONLY)
    }

    fn open_readwrite(&self, vol_fd: &File, path: &Path) -> Result<File> {
        openat(vol_fd, path, libc::O_RDWR)
    }

    fn file_extents(&self, file: &File) -> Result<Vec<(u64, u64)>> {
        let mut args: Fiemap = unsafe { zeroed() };
        args.fm_start = 0;
        args.fm_length = FIEMAP_MAX_OFFSET;
        args.fm_flags = FIEMAP_FLAG_SYNC;
        args.fm_extent_count = FIEMAP_EXTENT_BUDGET as u32;

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), ioc_fiemap() as _, &mut args as *mut _) };
        check(ret)?;

        let n = (args.fm_mapped_extents as usize).min(FIEMAP_EXTENT_BUDGET);
        Ok(args.fm_extents[..n]
            .iter()
            .map(|e| (e.fe_physical, e.fe_length))
            .collect())
    }

    fn clone_data(&self, dest: &File, src: &File, check_first: bool) -> Result<bool> {
        let len = src.metadata()?.len();
        let mut args: BtrfsIoctlSameArgs = unsafe { zeroed() };
        args.logical_offset = 0;
        args.length = len;
        args.dest_count = 1;
        args.info[0] = BtrfsIoctlSameExtentInfo {
            fd: dest.as_raw_fd() as i64,
            logical_offset: 0,
            bytes_deduped: 0,
            status: 0,
            reserved: 0,
        };

        let ret = unsafe {
            libc::ioctl(src.as_raw_fd(), ioc_file_extent_same() as _, &mut args as *mut _)
        };
        check(ret)?;

        let info = &args.info[0];
        if info.status == SAME_DATA_DIFFERS {
            if check_first {
                return Ok(false);
            }
            return Err(Error::new(std::io::ErrorKind::InvalidData, "extents differ"));
        }
        if info.status != 0 {
            return Err(Error::from_raw_os_error(-info.status));
        }
        Ok(info.bytes_deduped > 0)
    }

    fn compare_files(&self, a: &File, b: &File) -> Result<bool> {
        const BUF: usize = 64 * 1024;
        let len_a = a.metadata()?.len();
        let len_b = b.metadata()?.len();
        if len_a != len_b {
            return Ok(false);
        }
        let mut buf_a = vec![0u8; BUF];
        let mut buf_b = vec![0u8; BUF];
        let mut off = 0u64;
        while off < len_a {
            let want = std::cmp::min(BUF as u64, len_a - off) as usize;
            a.read_exact_at(&mut buf_a[..want], off)?;
            b.read_exact_at(&mut buf_b[..want], off)?;
            if buf_a[..want] != buf_b[..want] {
                return Ok(false);
            }
            off += want as u64;
        }
        Ok(true)
    }

    fn set_immutable(&self, fd: &File, on: bool) -> Result<bool> {
        let mut flags: libc::c_long = 0;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), fs_ioc_getflags() as _, &mut flags) };
        check(ret)?;
        let was_immutable = flags & FS_IMMUTABLE_FL != 0;

        let new_flags = if on {
            flags | FS_IMMUTABLE_FL
        } else {
            flags & !FS_IMMUTABLE_FL
        };
        if new_flags != flags {
            let ret = unsafe { libc::ioctl(fd.as_raw_fd(), fs_ioc_setflags() as _, &new_flags) };
            check(ret)?;
        }
        Ok(was_immutable)
    }

    fn fds_in_write_use(&self, fds: &[RawFd]) -> Result<HashSet<RawFd>> {
        let mut in_use = HashSet::new();
        for &fd in fds {
            let ret = unsafe { libc::fcntl(fd, F_SETLEASE, F_WRLCK) };
            if ret < 0 {
                let err = Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EBUSY) => {
                        in_use.insert(fd);
                        continue;
                    }
                    _ => return Err(err),
                }
            }
            // We only wanted to probe; release immediately.
            unsafe { libc::fcntl(fd, F_SETLEASE, F_UNLCK) };
        }
        Ok(in_use)
    }
}

/// Opens `path` relative to `dir`, resisting rename races the same way
/// `fopenat`/`fopenat_rw` do in the original implementation.
fn openat(dir: &File, path: &Path, flags: libc::c_int) -> Result<File> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(std::io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let fd = unsafe { libc::openat(dir.as_raw_fd(), c_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Opens the subvolume root at `path` as a directory descriptor, used by
/// the orchestrator to attach a `VolumeHandle`.
pub fn open_volume_dir(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(path)
}
