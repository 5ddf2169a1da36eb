//! The orchestrator (`spec.md` §4.6): owns the fd-rlimit policy, the
//! commit-durability trade-off, and the per-filesystem
//! scanner→grouper→hasher→cloner pipeline. Nothing else in the crate
//! calls `setrlimit` or toggles `PRAGMA synchronous` directly — this is
//! the single place those two pieces of process-global state are
//! touched, per the "raise once, never lower" and
//! "restore durability on every exit path" rules.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::catalog::Catalog;
use crate::cloner;
use crate::config::GlobalConfig;
use crate::error::{DedupError, Result};
use crate::fsprimitives::{linux::open_volume_dir, FsPrimitives};
use crate::grouper::Grouper;
use crate::hasher;
use crate::model::{Volume, VolumeHandle};
use crate::progress::ProgressSink;

/// Restores full commit durability on every exit path, including panics
/// unwinding through the pipeline. Holds the catalog's `&mut` for its
/// whole scope; callers reach the catalog through `guard.catalog` rather
/// than the original reference, which the borrow checker would otherwise
/// consider shadowed for as long as the guard is alive.
struct DurabilityGuard<'a> {
    catalog: &'a mut Catalog,
}

impl<'a> DurabilityGuard<'a> {
    fn enter(catalog: &'a mut Catalog) -> Result<Self> {
        catalog.set_durability(false)?;
        Ok(Self { catalog })
    }
}

impl<'a> Drop for DurabilityGuard<'a> {
    fn drop(&mut self) {
        let _ = self.catalog.set_durability(true);
    }
}

/// Summary returned after a dedup run across one or more volumes.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub clones_performed: u64,
    pub skipped: Vec<(i64, u64)>,
}

pub struct Orchestrator<F> {
    fs: F,
    cfg: GlobalConfig,
}

impl<F: FsPrimitives> Orchestrator<F> {
    pub fn new(fs: F, cfg: GlobalConfig) -> Self {
        Self { fs, cfg }
    }

    /// Opens `path` as a subvolume, attaching it to (or creating) its
    /// catalog row. `default_cutoff` only takes effect the first time this
    /// volume is seen.
    pub fn open_volume(&self, catalog: &Catalog, path: &Path, default_cutoff: u64) -> Result<Volume> {
        let dir = open_volume_dir(path).map_err(|e| DedupError::io("opening subvolume directory", e))?;
        if !self
            .fs
            .is_subvolume(&dir)
            .map_err(|e| DedupError::io("checking subvolume sentinel", e))?
        {
            return Err(DedupError::io(
                format!("{} is not a subvolume root", path.display()),
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            ));
        }

        let uuid = self.fs.fsid(&dir).map_err(|e| DedupError::io("reading filesystem uuid", e))?;
        let root_id = self.fs.root_id(&dir).map_err(|e| DedupError::io("reading subvolume root id", e))?;
        let st_dev = dir.metadata().map_err(|e| DedupError::io("statting subvolume directory", e))?.dev();

        let filesystem = catalog.get_or_create_filesystem(uuid)?;
        let (mut vol, _) = catalog.get_or_create_volume(filesystem.id, root_id, default_cutoff)?;
        vol.handle = Some(VolumeHandle {
            dir,
            st_dev,
            desc: path.display().to_string(),
        });
        catalog.record_path_history(vol.id, &path.display().to_string())?;
        Ok(vol)
    }

    /// Scans `path` only; no grouping, hashing, or cloning.
    pub fn scan_vol(
        &self,
        catalog: &Catalog,
        path: &Path,
        size_cutoff: Option<u64>,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let default_cutoff = size_cutoff.unwrap_or(crate::config::DEFAULT_SIZE_CUTOFF);
        let mut vol = self.open_volume(catalog, path, default_cutoff)?;
        if let Some(cutoff) = size_cutoff {
            if cutoff != vol.size_cutoff {
                catalog.set_size_cutoff(vol.id, cutoff)?;
                vol.size_cutoff = cutoff;
            }
        }
        crate::scanner::track_updated_files(&self.fs, catalog, &mut vol, progress)
    }

    /// Scans every volume in `paths`, then runs the grouper→hasher→cloner
    /// pipeline across them, one filesystem at a time (volumes on
    /// different filesystems never share a clone set, since extent clone
    /// only works within one filesystem).
    pub fn dedup_vols<P: AsRef<Path>>(
        &self,
        catalog: &mut Catalog,
        paths: &[P],
        progress: &mut dyn ProgressSink,
    ) -> Result<RunSummary> {
        let mut by_fs: HashMap<i64, Vec<Volume>> = HashMap::new();
        for p in paths {
            let mut vol = self.open_volume(catalog, p.as_ref(), crate::config::DEFAULT_SIZE_CUTOFF)?;
            crate::scanner::track_updated_files(&self.fs, catalog, &mut vol, progress)?;
            by_fs.entry(vol.fs_id).or_default().push(vol);
        }

        let mut summary = RunSummary::default();
        for (fs_id, volumes) in &by_fs {
            let vol_ids: Vec<i64> = volumes.iter().map(|v| v.id).collect();
            let vols: HashMap<i64, &Volume> = volumes.iter().map(|v| (v.id, v)).collect();

            let mut guard = DurabilityGuard::enter(catalog)?;

            let mut grouper = Grouper::new(vol_ids.clone(), self.cfg.window_size);
            while let Some(group) = grouper.next_group(guard.catalog)? {
                // Optimistically clear; hasher/cloner reassert has_updates
                // for anything they defer instead of resolve.
                guard.catalog.clear_has_updates(&vol_ids, group.size, group.size)?;

                let clone_sets =
                    hasher::narrow(&self.fs, guard.catalog, &vols, &group, &self.cfg, progress)?;
                for clone_set in &clone_sets {
                    let outcome = cloner::clone_candidates(
                        &self.fs,
                        guard.catalog,
                        &vols,
                        *fs_id,
                        group.size,
                        clone_set,
                        &self.cfg,
                        progress,
                    )?;
                    summary.clones_performed += outcome.clones_performed;
                    summary.skipped.extend(outcome.skipped);
                }
            }

            drop(guard);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsprimitives::fake::FakeFs;
    use crate::progress::NullProgressSink;
    use uuid::Uuid;

    /// End-to-end walk of `spec.md` §8 scenario 1: two identical files, one
    /// previously-unseen subvolume, `scan` then `dedup` clones once and a
    /// second `dedup` finds nothing left to do.
    #[test]
    fn scan_then_dedup_clones_once_and_is_idempotent() {
        let fake = FakeFs::new(Uuid::from_bytes([50; 16]), 7);
        fake.put_file(1, "a", &vec![0xABu8; 200]);
        fake.put_file(1, "b", &vec![0xABu8; 200]);
        fake.set_root_generation(1);
        let path = fake.vol_dir_path().to_path_buf();

        let orchestrator = Orchestrator::new(fake, GlobalConfig::default());
        let mut catalog = Catalog::open_in_memory().unwrap();
        let mut progress = NullProgressSink;

        orchestrator
            .scan_vol(&catalog, &path, Some(100), &mut progress)
            .unwrap();

        let summary = orchestrator
            .dedup_vols(&mut catalog, &[path.clone()], &mut progress)
            .unwrap();
        assert_eq!(summary.clones_performed, 1);

        let filesystem = catalog.get_or_create_filesystem(Uuid::from_bytes([50; 16])).unwrap();
        assert_eq!(catalog.dedup_events(filesystem.id).unwrap().len(), 1);

        // Second run: nothing changed on disk, and the first run cleared
        // has_updates for everything it resolved, so no clone is attempted.
        let summary2 = orchestrator
            .dedup_vols(&mut catalog, &[path], &mut progress)
            .unwrap();
        assert_eq!(summary2.clones_performed, 0, "idempotent rerun must not reclone");
        assert_eq!(
            catalog.dedup_events(filesystem.id).unwrap().len(),
            1,
            "audit log must not grow on a no-op rerun"
        );
    }

    #[test]
    fn file_below_size_cutoff_is_never_scanned() {
        let fake = FakeFs::new(Uuid::from_bytes([51; 16]), 7);
        fake.put_file(1, "tiny", &vec![0u8; 10]);
        fake.set_root_generation(1);
        let path = fake.vol_dir_path().to_path_buf();

        let orchestrator = Orchestrator::new(fake, GlobalConfig::default());
        let catalog = Catalog::open_in_memory().unwrap();
        let mut progress = NullProgressSink;

        orchestrator
            .scan_vol(&catalog, &path, Some(100), &mut progress)
            .unwrap();

        let filesystem = catalog.get_or_create_filesystem(Uuid::from_bytes([51; 16])).unwrap();
        let (vol, _) = catalog.get_or_create_volume(filesystem.id, 7, 100).unwrap();
        assert_eq!(catalog.inode_count(vol.id).unwrap(), 0);
    }
}
