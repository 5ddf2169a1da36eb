//! The cloner (`spec.md` §4.5): takes candidates that survived both
//! hashing stages, reopens them read-write, proves equivalence with a
//! strong digest plus a byte compare, and asks the kernel to collapse
//! their extents. Every candidate moves through
//! `Opened → Hashed → Bucketed → (Source | Destination)`, with
//! `skipped`/`deleted` exits at each fallible step.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::catalog::Catalog;
use crate::config::GlobalConfig;
use crate::error::{DedupError, Result};
use crate::fsprimitives::FsPrimitives;
use crate::hasher::Candidate;
use crate::model::Volume;
use crate::progress::ProgressSink;

/// Extra descriptors a clone pass needs beyond the candidates themselves
/// (catalog connection, stdio, the volume directory fds in play).
const RESERVED_FDS: u64 = 7;

/// Outcome of attempting to clone one size-group's candidates.
#[derive(Debug, Default)]
pub struct CloneOutcome {
    /// Number of destinations whose extents were actually collapsed.
    pub clones_performed: u64,
    /// Candidates returned to the catalog with `has_updates` reasserted,
    /// to be retried on a future run.
    pub skipped: Vec<(i64, u64)>,
}

/// RAII guard: sets the immutable attribute on a set of descriptors and
/// restores each one's previous state on drop, regardless of how the
/// scope exits. Spans hashing, the race re-check, and the clone itself —
/// the whole window during which a concurrent writer could invalidate
/// what was just proven about the file's content.
struct ImmutableGuard<'a, F: FsPrimitives> {
    fs: &'a F,
    restore: Vec<(&'a File, bool)>,
}

impl<'a, F: FsPrimitives> ImmutableGuard<'a, F> {
    fn acquire(fs: &'a F, files: &[&'a File]) -> Result<Self> {
        let mut restore = Vec::with_capacity(files.len());
        for file in files {
            let was = fs
                .set_immutable(file, true)
                .map_err(|e| DedupError::io("setting immutable flag", e))?;
            restore.push((*file, was));
        }
        Ok(Self { fs, restore })
    }
}

impl<'a, F: FsPrimitives> Drop for ImmutableGuard<'a, F> {
    fn drop(&mut self) {
        for (file, was) in &self.restore {
            let _ = self.fs.set_immutable(file, *was);
        }
    }
}

enum Opened {
    Ready { vol_id: i64, ino: u64, file: File },
    Deleted { vol_id: i64, ino: u64 },
    Skipped { vol_id: i64, ino: u64 },
}

/// Runs the full clone pass over one size-group's narrowed `candidates`.
pub fn clone_candidates(
    fs: &impl FsPrimitives,
    catalog: &mut Catalog,
    vols: &HashMap<i64, &Volume>,
    fs_id: i64,
    item_size: u64,
    candidates: &[Candidate],
    cfg: &GlobalConfig,
    progress: &mut dyn ProgressSink,
) -> Result<CloneOutcome> {
    let mut outcome = CloneOutcome::default();

    // 1. Budget.
    let volumes_in_set = candidates
        .iter()
        .map(|c| c.vol_id)
        .collect::<std::collections::HashSet<_>>()
        .len() as u64;
    let required = 2 * candidates.len() as u64 + RESERVED_FDS + volumes_in_set;

    let mut limits = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) };
    if ret != 0 {
        return Err(DedupError::io("reading fd rlimit", std::io::Error::last_os_error()));
    }
    if required > limits.rlim_cur {
        if required > limits.rlim_max {
            progress.notify(&format!(
                "size-group of {} bytes needs {} fds, hard limit is {}; deferring whole group",
                item_size, required, limits.rlim_max
            ));
            for c in candidates {
                catalog.reassert_has_updates(c.vol_id, c.ino)?;
                outcome.skipped.push((c.vol_id, c.ino));
            }
            return Ok(outcome);
        }
        let mut raised = limits;
        raised.rlim_cur = required;
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) };
        if ret != 0 {
            return Err(DedupError::io("raising fd rlimit", std::io::Error::last_os_error()));
        }
    }

    // 2. Open read-write.
    let mut opened = Vec::with_capacity(candidates.len());
    for c in candidates {
        let vol = vols
            .get(&c.vol_id)
            .unwrap_or_else(|| panic!("cloner: volume {} not open", c.vol_id));
        let path = match fs.lookup_ino_path_one(vol.fd(), c.ino) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                opened.push(Opened::Deleted { vol_id: c.vol_id, ino: c.ino });
                continue;
            }
            Err(e) => return Err(DedupError::io("resolving path before clone", e)),
        };
        match fs.open_readwrite(vol.fd(), &path) {
            Ok(file) => opened.push(Opened::Ready { vol_id: c.vol_id, ino: c.ino, file }),
            Err(e) => match e.raw_os_error() {
                Some(libc::ETXTBSY) | Some(libc::EACCES) => {
                    opened.push(Opened::Skipped { vol_id: c.vol_id, ino: c.ino });
                }
                Some(libc::ENOENT) => {
                    opened.push(Opened::Deleted { vol_id: c.vol_id, ino: c.ino });
                }
                _ => return Err(DedupError::io("opening candidate read-write", e)),
            },
        }
    }

    let mut ready: Vec<(i64, u64, File)> = Vec::new();
    for entry in opened {
        match entry {
            Opened::Ready { vol_id, ino, file } => ready.push((vol_id, ino, file)),
            Opened::Deleted { vol_id, ino } => catalog.delete_inode(vol_id, ino)?,
            Opened::Skipped { vol_id, ino } => {
                catalog.reassert_has_updates(vol_id, ino)?;
                outcome.skipped.push((vol_id, ino));
            }
        }
    }

    if ready.len() < 2 {
        for (vol_id, ino, _) in &ready {
            catalog.reassert_has_updates(*vol_id, *ino)?;
            outcome.skipped.push((*vol_id, *ino));
        }
        return Ok(outcome);
    }

    // 3. Scoped immutability, plus a write-lease probe over the same scope.
    // `ready` stays alive and un-moved for the rest of the function so the
    // guard's borrows on its files remain valid; everything below operates
    // by index instead of taking ownership of any entry.
    let files: Vec<&File> = ready.iter().map(|(_, _, f)| f).collect();
    let guard = ImmutableGuard::acquire(fs, &files)?;
    let raw_fds: Vec<_> = files.iter().map(|f| f.as_raw_fd()).collect();
    let busy = fs
        .fds_in_write_use(&raw_fds)
        .map_err(|e| DedupError::io("probing for writers", e))?;

    // 4. Strong hash, then race re-check.
    let mut by_digest: HashMap<[u8; 20], Vec<usize>> = HashMap::new();
    for (idx, (vol_id, ino, file)) in ready.iter().enumerate() {
        if busy.contains(&file.as_raw_fd()) {
            catalog.reassert_has_updates(*vol_id, *ino)?;
            outcome.skipped.push((*vol_id, *ino));
            continue;
        }

        let digest = stream_digest(file, cfg.bufsize)
            .map_err(|e| DedupError::io("computing strong digest", e))?;

        let meta = file.metadata().map_err(|e| DedupError::io("post-hash fstat", e))?;
        let vol = vols.get(vol_id).expect("volume checked open above");
        if meta.dev() != vol.st_dev() || meta.ino() != *ino {
            catalog.reassert_has_updates(*vol_id, *ino)?;
            outcome.skipped.push((*vol_id, *ino));
            continue;
        }
        if meta.len() != item_size {
            if meta.len() < vol.size_cutoff {
                catalog.delete_inode(*vol_id, *ino)?;
            } else {
                catalog.reassert_has_updates(*vol_id, *ino)?;
                outcome.skipped.push((*vol_id, *ino));
            }
            continue;
        }

        by_digest.entry(digest).or_default().push(idx);
    }

    // 5/6. Bucket by digest, byte-compare, clone. A singleton bucket means
    // the strong digest proved this candidate matches no one else in the
    // group; that's a completed pass, not a deferral, so has_updates stays
    // cleared rather than being reasserted (otherwise it would be re-hashed
    // on every future run and the pipeline would never reach quiescence).
    for bucket in by_digest.values() {
        if bucket.len() < 2 {
            continue;
        }

        let (src_vol, src_ino, src_file) = &ready[bucket[0]];
        let mut this_set_succeeded = vec![(*src_vol, *src_ino)];

        for &dest_idx in &bucket[1..] {
            let (dest_vol, dest_ino, dest_file) = &ready[dest_idx];
            let equal = fs
                .compare_files(dest_file, src_file)
                .map_err(|e| DedupError::io("byte-comparing clone candidates", e))?;
            if !equal {
                return Err(DedupError::HashCollision {
                    a: format!("vol {} ino {}", src_vol, src_ino),
                    b: format!("vol {} ino {}", dest_vol, dest_ino),
                });
            }
            match fs.clone_data(dest_file, src_file, true) {
                Ok(true) => {
                    this_set_succeeded.push((*dest_vol, *dest_ino));
                    outcome.clones_performed += 1;
                }
                Ok(false) => {
                    progress.notify(&format!(
                        "vol {} ino {} already shares extents with source, nothing to do",
                        dest_vol, dest_ino
                    ));
                }
                Err(e) => return Err(DedupError::io("cloning extents", e)),
            }
        }

        // 7. Audit: one event per digest bucket, covering only the inodes
        // this bucket actually proved share content.
        if this_set_succeeded.len() > 1 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            catalog.record_dedup_event(fs_id, item_size, now, &this_set_succeeded)?;
        }
    }

    drop(guard);

    Ok(outcome)
}

/// Digests `file` from its start through EOF, using `&File` so the caller
/// can keep the same descriptor borrowed elsewhere (by `ImmutableGuard`)
/// while this runs.
fn stream_digest(file: &File, bufsize: usize) -> std::io::Result<[u8; 20]> {
    use std::io::{Seek, SeekFrom};
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; bufsize];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}
