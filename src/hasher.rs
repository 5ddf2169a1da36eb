//! Two-stage candidate narrowing (`spec.md` §4.4): mini-hash then
//! fiemap-hash, each cheaper than the next stage and each only run over
//! survivors of the previous one. Candidates that pass both advance to
//! the cloner as clone-set groups; singletons at either stage are
//! dropped without ever being opened for writing.

use std::collections::HashMap;
use std::io::Read;

use sha1::{Digest, Sha1};

use crate::catalog::Catalog;
use crate::config::GlobalConfig;
use crate::error::{DedupError, Result};
use crate::fsprimitives::FsPrimitives;
use crate::model::{SizeGroup, Volume};
use crate::progress::ProgressSink;

/// One inode that survived both narrowing stages, ready for the cloner.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub vol_id: i64,
    pub ino: u64,
}

/// Narrows `group` down to clone-set candidates. `vols` must contain an
/// open `Volume` for every `vol_id` appearing in `group.inodes`.
pub fn narrow(
    fs: &impl FsPrimitives,
    catalog: &Catalog,
    vols: &HashMap<i64, &Volume>,
    group: &SizeGroup,
    cfg: &GlobalConfig,
    progress: &mut dyn ProgressSink,
) -> Result<Vec<Vec<Candidate>>> {
    let mut opened = Vec::with_capacity(group.inodes.len());
    for inode in &group.inodes {
        let vol = vols
            .get(&inode.vol_id)
            .unwrap_or_else(|| panic!("hasher: volume {} not open", inode.vol_id));
        let path = match fs.lookup_ino_path_one(vol.fd(), inode.ino) {
            Ok(path) => path,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                progress.notify(&format!(
                    "inode {} (vol {}) vanished before hashing, dropping",
                    inode.ino, inode.vol_id
                ));
                catalog.delete_inode(inode.vol_id, inode.ino)?;
                continue;
            }
            Err(e) => return Err(DedupError::io("resolving path for hashing", e)),
        };
        let file = match fs.open_readonly(vol.fd(), &path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                catalog.delete_inode(inode.vol_id, inode.ino)?;
                continue;
            }
            Err(e) => return Err(DedupError::io("opening candidate for mini-hash", e)),
        };
        opened.push((inode.vol_id, inode.ino, file));
    }

    // Stage A: mini-hash over a bounded prefix.
    let mut by_mini: HashMap<[u8; 20], Vec<(i64, u64, std::fs::File)>> = HashMap::new();
    for (vol_id, ino, mut file) in opened {
        let mut buf = vec![0u8; cfg.bufsize];
        let mut total = 0usize;
        loop {
            let n = file
                .read(&mut buf[total..])
                .map_err(|e| DedupError::io("reading mini-hash prefix", e))?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        let digest: [u8; 20] = Sha1::digest(&buf[..total]).into();
        catalog.set_mini_hash(vol_id, ino, &digest)?;
        by_mini.entry(digest).or_default().push((vol_id, ino, file));
    }

    // Stage B: fiemap-hash over survivors of stage A.
    let mut clone_sets = Vec::new();
    for (_, bucket) in by_mini {
        if bucket.len() < 2 {
            continue;
        }
        let mut by_fiemap: HashMap<[u8; 20], Vec<Candidate>> = HashMap::new();
        for (vol_id, ino, file) in bucket {
            let extents = fs
                .file_extents(&file)
                .map_err(|e| DedupError::io("reading extent map for fiemap-hash", e))?;
            let mut hasher = Sha1::new();
            for (physical, length) in &extents {
                hasher.update(physical.to_le_bytes());
                hasher.update(length.to_le_bytes());
            }
            let digest: [u8; 20] = hasher.finalize().into();
            catalog.set_fiemap_hash(vol_id, ino, &digest)?;
            by_fiemap
                .entry(digest)
                .or_default()
                .push(Candidate { vol_id, ino });
        }
        for (_, candidates) in by_fiemap {
            if candidates.len() >= 2 {
                clone_sets.push(candidates);
            }
        }
    }

    Ok(clone_sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsprimitives::fake::FakeFs;
    use crate::model::VolumeHandle;
    use uuid::Uuid;

    fn open_vol(cat: &Catalog, fs: &FakeFs, fs_id: i64) -> Volume {
        let (mut vol, _) = cat.get_or_create_volume(fs_id, 1, 0).unwrap();
        vol.handle = Some(VolumeHandle {
            dir: fs.vol_dir(),
            st_dev: 0,
            desc: "fake".into(),
        });
        vol
    }

    #[test]
    fn identical_prefix_and_layout_survives_both_stages() {
        let cat = Catalog::open_in_memory().unwrap();
        let filesystem = cat.get_or_create_filesystem(Uuid::from_bytes([20; 16])).unwrap();
        let fake = FakeFs::new(filesystem.uuid, 1);

        fake.put_file(1, "a", b"hello world");
        fake.put_file(1, "b", b"hello world");
        fake.set_extents("a", vec![(1000, 11)]);
        fake.set_extents("b", vec![(1000, 11)]);

        let vol = open_vol(&cat, &fake, filesystem.id);
        cat.upsert_inode_seen(vol.id, fake.ino_of("a"), 11).unwrap();
        cat.upsert_inode_seen(vol.id, fake.ino_of("b"), 11).unwrap();

        let group = SizeGroup {
            size: 11,
            inodes: cat.inodes_for_size(&[vol.id], 11).unwrap(),
        };
        let mut vols = HashMap::new();
        vols.insert(vol.id, &vol);
        let cfg = GlobalConfig::default();
        let mut progress = crate::progress::NullProgressSink;

        let sets = narrow(&fake, &cat, &vols, &group, &cfg, &mut progress).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].len(), 2);
    }

    #[test]
    fn differing_prefix_drops_at_stage_a() {
        let cat = Catalog::open_in_memory().unwrap();
        let filesystem = cat.get_or_create_filesystem(Uuid::from_bytes([21; 16])).unwrap();
        let fake = FakeFs::new(filesystem.uuid, 1);

        fake.put_file(1, "a", b"hello world");
        fake.put_file(1, "b", b"goodbye!!!!");

        let vol = open_vol(&cat, &fake, filesystem.id);
        cat.upsert_inode_seen(vol.id, fake.ino_of("a"), 11).unwrap();
        cat.upsert_inode_seen(vol.id, fake.ino_of("b"), 11).unwrap();

        let group = SizeGroup {
            size: 11,
            inodes: cat.inodes_for_size(&[vol.id], 11).unwrap(),
        };
        let mut vols = HashMap::new();
        vols.insert(vol.id, &vol);
        let cfg = GlobalConfig::default();
        let mut progress = crate::progress::NullProgressSink;

        let sets = narrow(&fake, &cat, &vols, &group, &cfg, &mut progress).unwrap();
        assert!(sets.is_empty());
    }

    #[test]
    fn same_content_different_layout_drops_at_stage_b() {
        let cat = Catalog::open_in_memory().unwrap();
        let filesystem = cat.get_or_create_filesystem(Uuid::from_bytes([22; 16])).unwrap();
        let fake = FakeFs::new(filesystem.uuid, 1);

        fake.put_file(1, "a", b"hello world");
        fake.put_file(1, "b", b"hello world");
        fake.set_extents("a", vec![(1000, 11)]);
        fake.set_extents("b", vec![(2000, 11)]);

        let vol = open_vol(&cat, &fake, filesystem.id);
        cat.upsert_inode_seen(vol.id, fake.ino_of("a"), 11).unwrap();
        cat.upsert_inode_seen(vol.id, fake.ino_of("b"), 11).unwrap();

        let group = SizeGroup {
            size: 11,
            inodes: cat.inodes_for_size(&[vol.id], 11).unwrap(),
        };
        let mut vols = HashMap::new();
        vols.insert(vol.id, &vol);
        let cfg = GlobalConfig::default();
        let mut progress = crate::progress::NullProgressSink;

        let sets = narrow(&fake, &cat, &vols, &group, &cfg, &mut progress).unwrap();
        assert!(sets.is_empty(), "already-shared extents need no cloning work");
    }

    #[test]
    fn vanished_inode_is_dropped_from_catalog() {
        let cat = Catalog::open_in_memory().unwrap();
        let filesystem = cat.get_or_create_filesystem(Uuid::from_bytes([23; 16])).unwrap();
        let fake = FakeFs::new(filesystem.uuid, 1);

        fake.put_file(1, "a", b"hello world");
        // This inode is tracked in the catalog but was never materialized on disk.
        let vol = open_vol(&cat, &fake, filesystem.id);
        cat.upsert_inode_seen(vol.id, fake.ino_of("a"), 11).unwrap();
        cat.upsert_inode_seen(vol.id, 999_999_999, 11).unwrap();

        let group = SizeGroup {
            size: 11,
            inodes: cat.inodes_for_size(&[vol.id], 11).unwrap(),
        };
        let mut vols = HashMap::new();
        vols.insert(vol.id, &vol);
        let cfg = GlobalConfig::default();
        let mut progress = crate::progress::NullProgressSink;

        let sets = narrow(&fake, &cat, &vols, &group, &cfg, &mut progress).unwrap();
        assert!(sets.is_empty());
        assert!(cat.get_inode(vol.id, 999_999_999).unwrap().is_none());
    }
}
