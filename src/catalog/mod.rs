//! The persistent catalog: a transactional store of `Filesystem`, `Volume`,
//! `Inode`, `VolumePathHistory`, `DedupEvent` and `DedupEventInode` rows,
//! backed by SQLite through `rusqlite`. This module owns the schema
//! bootstrap only (`ensure_schema`); it deliberately does not grow a
//! migration framework, since the spec treats the catalog's schema
//! *lifecycle* as out of scope.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{DedupError, Result};
use crate::model::{DedupEvent, Filesystem, Inode, Volume};

/// Clamps a `u64` size/generation bound into SQLite's signed storage class
/// instead of letting `as i64` wrap `u64::MAX` (a common "no upper bound"
/// sentinel) into `-1`, which would silently match nothing.
fn bound_to_sql(v: u64) -> i64 {
    v.min(i64::MAX as u64) as i64
}

mod schema;

/// A handle onto one catalog database.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (creating if absent) the catalog database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let cat = Self { conn };
        cat.ensure_schema()?;
        Ok(cat)
    }

    /// Opens a private in-memory catalog, used by tests and by nothing else.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cat = Self { conn };
        cat.ensure_schema()?;
        Ok(cat)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    /// Switches commit durability. During a dedup run the pipeline trades
    /// fsync-per-commit for throughput (`synchronous = NORMAL` under WAL);
    /// it must restore `FULL` before the final commit on every exit path
    /// (see `DurabilityGuard`).
    pub fn set_durability(&self, full: bool) -> Result<()> {
        let mode = if full { "FULL" } else { "NORMAL" };
        self.conn
            .pragma_update(None, "synchronous", mode)
            .map_err(DedupError::from)
    }

    // -- Filesystem / Volume -------------------------------------------------

    /// Returns the `Filesystem` row for `uuid`, creating it on first sighting.
    pub fn get_or_create_filesystem(&self, uuid: Uuid) -> Result<Filesystem> {
        let uuid_bytes = uuid.as_bytes().to_vec();
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM filesystem WHERE uuid = ?1",
                params![uuid_bytes],
                |r| r.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => id,
            None => {
                self.conn.execute(
                    "INSERT INTO filesystem (uuid) VALUES (?1)",
                    params![uuid_bytes],
                )?;
                self.conn.last_insert_rowid()
            }
        };
        Ok(Filesystem { id, uuid })
    }

    /// Returns the `(Volume, created)` row for `(fs_id, root_id)`, creating
    /// it with `default_cutoff` on first sighting. The returned `Volume`
    /// has no `handle` attached; the caller attaches one after opening the
    /// subvolume's directory.
    pub fn get_or_create_volume(
        &self,
        fs_id: i64,
        root_id: u64,
        default_cutoff: u64,
    ) -> Result<(Volume, bool)> {
        let row = self
            .conn
            .query_row(
                "SELECT id, size_cutoff, last_tracked_generation, last_tracked_size_cutoff
                 FROM volume WHERE fs_id = ?1 AND root_id = ?2",
                params![fs_id, root_id as i64],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)? as u64,
                        r.get::<_, i64>(2)? as u64,
                        r.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                    ))
                },
            )
            .optional()?;

        let (id, size_cutoff, last_tracked_generation, last_tracked_size_cutoff, created) =
            match row {
                Some((id, cutoff, gen, last_cutoff)) => (id, cutoff, gen, last_cutoff, false),
                None => {
                    self.conn.execute(
                        "INSERT INTO volume (fs_id, root_id, size_cutoff, last_tracked_generation, last_tracked_size_cutoff)
                         VALUES (?1, ?2, ?3, 0, NULL)",
                        params![fs_id, root_id as i64, default_cutoff as i64],
                    )?;
                    (self.conn.last_insert_rowid(), default_cutoff, 0, None, true)
                }
            };

        Ok((
            Volume {
                id,
                fs_id,
                root_id,
                size_cutoff,
                last_tracked_generation,
                last_tracked_size_cutoff,
                handle: None,
            },
            created,
        ))
    }

    /// Updates the size cutoff for a volume (e.g. from a `--size-cutoff` CLI
    /// override). Shrinking it is exactly what forces a full rescan, via
    /// `last_tracked_size_cutoff` staying above the new value.
    pub fn set_size_cutoff(&self, vol_id: i64, cutoff: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE volume SET size_cutoff = ?1 WHERE id = ?2",
            params![cutoff as i64, vol_id],
        )?;
        Ok(())
    }

    /// Records a sighting of `path` for `vol_id`. Append-only; duplicate
    /// sightings of the same path are not re-inserted.
    pub fn record_path_history(&self, vol_id: i64, path: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO volume_path_history (vol_id, path) VALUES (?1, ?2)",
            params![vol_id, path],
        )?;
        Ok(())
    }

    pub fn path_history(&self, vol_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM volume_path_history WHERE vol_id = ?1 ORDER BY rowid")?;
        let rows = stmt
            .query_map(params![vol_id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Marks `vol_id` as scanned through `top_generation` with the cutoff
    /// that produced it. Called only after a scan completes cleanly.
    pub fn set_volume_scanned(&self, vol_id: i64, top_generation: u64, cutoff: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE volume SET last_tracked_generation = ?1, last_tracked_size_cutoff = ?2 WHERE id = ?3",
            params![top_generation as i64, cutoff as i64, vol_id],
        )?;
        Ok(())
    }

    /// Forgets all tracked inodes for a volume and resets its generation
    /// cursor, without touching the audit log.
    pub fn forget_volume(&self, vol_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM inode WHERE vol_id = ?1", params![vol_id])?;
        self.conn.execute(
            "UPDATE volume SET last_tracked_generation = 0, last_tracked_size_cutoff = NULL WHERE id = ?1",
            params![vol_id],
        )?;
        Ok(())
    }

    pub fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        let mut stmt = self.conn.prepare("SELECT id, uuid FROM filesystem")?;
        let rows = stmt
            .query_map([], |r| {
                let id: i64 = r.get(0)?;
                let uuid_bytes: Vec<u8> = r.get(1)?;
                Ok((id, uuid_bytes))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, bytes)| {
                let arr: [u8; 16] = bytes.try_into().ok()?;
                Some(Filesystem {
                    id,
                    uuid: Uuid::from_bytes(arr),
                })
            })
            .collect())
    }

    pub fn list_volumes(&self, fs_id: i64) -> Result<Vec<Volume>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, root_id, size_cutoff, last_tracked_generation, last_tracked_size_cutoff
             FROM volume WHERE fs_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![fs_id], |r| {
                Ok(Volume {
                    id: r.get(0)?,
                    fs_id,
                    root_id: r.get::<_, i64>(1)? as u64,
                    size_cutoff: r.get::<_, i64>(2)? as u64,
                    last_tracked_generation: r.get::<_, i64>(3)? as u64,
                    last_tracked_size_cutoff: r.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                    handle: None,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn inode_count(&self, vol_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM inode WHERE vol_id = ?1",
                params![vol_id],
                |r| r.get(0),
            )
            .map_err(DedupError::from)
    }

    // -- Inode ----------------------------------------------------------------

    /// Upserts an inode sighting from the scanner: sets its size and flags
    /// it for the next dedup pass.
    pub fn upsert_inode_seen(&self, vol_id: i64, ino: u64, size: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO inode (vol_id, ino, size, has_updates, mini_hash, fiemap_hash)
             VALUES (?1, ?2, ?3, 1, NULL, NULL)
             ON CONFLICT(vol_id, ino) DO UPDATE SET size = excluded.size, has_updates = 1",
            params![vol_id, ino as i64, size as i64],
        )?;
        Ok(())
    }

    pub fn get_inode(&self, vol_id: i64, ino: u64) -> Result<Option<Inode>> {
        self.conn
            .query_row(
                "SELECT size, has_updates, mini_hash, fiemap_hash FROM inode
                 WHERE vol_id = ?1 AND ino = ?2",
                params![vol_id, ino as i64],
                |r| {
                    Ok(Inode {
                        vol_id,
                        ino,
                        size: r.get::<_, i64>(0)? as u64,
                        has_updates: r.get::<_, i64>(1)? != 0,
                        mini_hash: r.get(2)?,
                        fiemap_hash: r.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(DedupError::from)
    }

    pub fn delete_inode(&self, vol_id: i64, ino: u64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM inode WHERE vol_id = ?1 AND ino = ?2",
            params![vol_id, ino as i64],
        )?;
        Ok(())
    }

    pub fn set_mini_hash(&self, vol_id: i64, ino: u64, hash: &[u8]) -> Result<()> {
        self.conn.execute(
            "UPDATE inode SET mini_hash = ?1 WHERE vol_id = ?2 AND ino = ?3",
            params![hash, vol_id, ino as i64],
        )?;
        Ok(())
    }

    pub fn set_fiemap_hash(&self, vol_id: i64, ino: u64, hash: &[u8]) -> Result<()> {
        self.conn.execute(
            "UPDATE inode SET fiemap_hash = ?1 WHERE vol_id = ?2 AND ino = ?3",
            params![hash, vol_id, ino as i64],
        )?;
        Ok(())
    }

    pub fn reassert_has_updates(&self, vol_id: i64, ino: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE inode SET has_updates = 1 WHERE vol_id = ?1 AND ino = ?2",
            params![vol_id, ino as i64],
        )?;
        Ok(())
    }

    /// Clears `has_updates` for every tracked inode in `vol_ids` whose size
    /// falls within `[min_size, max_size]` (inclusive both ends, matching
    /// the windowed query's half-open-per-page sweep).
    pub fn clear_has_updates(&self, vol_ids: &[i64], min_size: u64, max_size: u64) -> Result<()> {
        if vol_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vol_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE inode SET has_updates = 0
             WHERE vol_id IN ({placeholders}) AND size >= ? AND size <= ?"
        );
        let mut p: Vec<rusqlite::types::Value> =
            vol_ids.iter().map(|v| (*v).into()).collect();
        p.push(bound_to_sql(min_size).into());
        p.push(bound_to_sql(max_size).into());
        self.conn.execute(&sql, params_from_iter(p))?;
        Ok(())
    }

    /// Returns up to `limit` distinct sizes with at least two inodes
    /// pending updates across `vol_ids`, at or below `window_start`,
    /// in descending order. This is the pagination primitive the grouper
    /// uses to bound its working set (`spec.md` §4.3).
    pub fn size_keys_page(
        &self,
        vol_ids: &[i64],
        window_start: u64,
        limit: usize,
    ) -> Result<Vec<u64>> {
        if vol_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vol_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT size FROM inode
             WHERE vol_id IN ({placeholders}) AND has_updates = 1 AND size <= ?
             GROUP BY size
             HAVING COUNT(*) >= 2
             ORDER BY size DESC
             LIMIT ?"
        );
        let mut p: Vec<rusqlite::types::Value> =
            vol_ids.iter().map(|v| (*v).into()).collect();
        p.push(bound_to_sql(window_start).into());
        p.push((limit as i64).into());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(p), |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().map(|v| v as u64).collect())
    }

    /// All tracked inodes across `vol_ids` at exactly `size`.
    pub fn inodes_for_size(&self, vol_ids: &[i64], size: u64) -> Result<Vec<Inode>> {
        if vol_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vol_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT vol_id, ino, has_updates, mini_hash, fiemap_hash FROM inode
             WHERE vol_id IN ({placeholders}) AND size = ?"
        );
        let mut p: Vec<rusqlite::types::Value> =
            vol_ids.iter().map(|v| (*v).into()).collect();
        p.push((size as i64).into());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(p), |r| {
                Ok(Inode {
                    vol_id: r.get(0)?,
                    ino: r.get::<_, i64>(1)? as u64,
                    size,
                    has_updates: r.get::<_, i64>(2)? != 0,
                    mini_hash: r.get(3)?,
                    fiemap_hash: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- Audit log --------------------------------------------------------

    /// Appends one `DedupEvent` plus one `DedupEventInode` per entry in
    /// `inodes` (source first, then each successful destination), in a
    /// single transaction.
    pub fn record_dedup_event(
        &mut self,
        fs_id: i64,
        item_size: u64,
        created: i64,
        inodes: &[(i64, u64)],
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO dedup_event (fs_id, item_size, created) VALUES (?1, ?2, ?3)",
            params![fs_id, item_size as i64, created],
        )?;
        let event_id = tx.last_insert_rowid();
        for (vol_id, ino) in inodes {
            tx.execute(
                "INSERT INTO dedup_event_inode (event_id, ino, vol_id) VALUES (?1, ?2, ?3)",
                params![event_id, *ino as i64, vol_id],
            )?;
        }
        tx.commit()?;
        Ok(event_id)
    }

    pub fn dedup_events(&self, fs_id: i64) -> Result<Vec<DedupEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_size, created FROM dedup_event WHERE fs_id = ?1 ORDER BY created",
        )?;
        let rows = stmt
            .query_map(params![fs_id], |r| {
                Ok(DedupEvent {
                    id: r.get(0)?,
                    fs_id,
                    item_size: r.get::<_, i64>(1)? as u64,
                    created: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_created_once() {
        let cat = Catalog::open_in_memory().unwrap();
        let uuid = Uuid::from_bytes([1; 16]);
        let fs1 = cat.get_or_create_filesystem(uuid).unwrap();
        let fs2 = cat.get_or_create_filesystem(uuid).unwrap();
        assert_eq!(fs1.id, fs2.id);
    }

    #[test]
    fn volume_created_with_default_cutoff() {
        let cat = Catalog::open_in_memory().unwrap();
        let fs = cat.get_or_create_filesystem(Uuid::from_bytes([2; 16])).unwrap();
        let (vol, created) = cat.get_or_create_volume(fs.id, 5, 8 << 20).unwrap();
        assert!(created);
        assert_eq!(vol.size_cutoff, 8 << 20);
        let (vol2, created2) = cat.get_or_create_volume(fs.id, 5, 16 << 20).unwrap();
        assert!(!created2);
        assert_eq!(vol2.size_cutoff, 8 << 20, "second sighting must not override cutoff");
    }

    #[test]
    fn shrinking_cutoff_does_not_auto_clear_last_tracked() {
        // set_size_cutoff only changes size_cutoff; scanner decides whether
        // a rescan is needed by comparing against last_tracked_size_cutoff.
        let cat = Catalog::open_in_memory().unwrap();
        let fs = cat.get_or_create_filesystem(Uuid::from_bytes([3; 16])).unwrap();
        let (vol, _) = cat.get_or_create_volume(fs.id, 1, 16 << 20).unwrap();
        cat.set_volume_scanned(vol.id, 42, 16 << 20).unwrap();
        cat.set_size_cutoff(vol.id, 8 << 20).unwrap();
        let (vol2, _) = cat.get_or_create_volume(fs.id, 1, 16 << 20).unwrap();
        assert_eq!(vol2.size_cutoff, 8 << 20);
        assert_eq!(vol2.last_tracked_size_cutoff, Some(16 << 20));
    }

    #[test]
    fn inode_upsert_and_group_by_size() {
        let cat = Catalog::open_in_memory().unwrap();
        let fs = cat.get_or_create_filesystem(Uuid::from_bytes([4; 16])).unwrap();
        let (vol, _) = cat.get_or_create_volume(fs.id, 1, 0).unwrap();
        cat.upsert_inode_seen(vol.id, 10, 1024).unwrap();
        cat.upsert_inode_seen(vol.id, 11, 1024).unwrap();
        cat.upsert_inode_seen(vol.id, 12, 2048).unwrap();

        let sizes = cat.size_keys_page(&[vol.id], u64::MAX, 1024).unwrap();
        assert_eq!(sizes, vec![1024]); // 2048 has only one inode, dropped

        let inodes = cat.inodes_for_size(&[vol.id], 1024).unwrap();
        assert_eq!(inodes.len(), 2);
    }

    #[test]
    fn forget_volume_resets_generation_but_not_events() {
        let mut cat = Catalog::open_in_memory().unwrap();
        let fs = cat.get_or_create_filesystem(Uuid::from_bytes([5; 16])).unwrap();
        let (vol, _) = cat.get_or_create_volume(fs.id, 1, 0).unwrap();
        cat.upsert_inode_seen(vol.id, 1, 10).unwrap();
        cat.set_volume_scanned(vol.id, 99, 0).unwrap();
        cat.record_dedup_event(fs.id, 10, 0, &[(vol.id, 1), (vol.id, 2)])
            .unwrap();

        cat.forget_volume(vol.id).unwrap();
        assert_eq!(cat.inode_count(vol.id).unwrap(), 0);
        let (vol2, _) = cat.get_or_create_volume(fs.id, 1, 0).unwrap();
        assert_eq!(vol2.last_tracked_generation, 0);
        assert_eq!(cat.dedup_events(fs.id).unwrap().len(), 1, "forget must not touch the audit log");
    }
}
