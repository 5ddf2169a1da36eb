//! Candidate grouping (`spec.md` §4.3): pages through distinct sizes with
//! at least two inodes pending updates, largest first, materializing each
//! group's full membership only when it's actually yielded. The page size
//! (`window_size`) bounds how many size-keys are pulled into memory at
//! once, keeping the working set bounded for filesystems with very wide
//! size distributions.
//!
//! `Grouper` takes the catalog as a parameter to `next_group` rather than
//! storing a borrow of it, so a caller can drive it one group at a time
//! and still get `&mut Catalog` access in between — the hasher and cloner
//! stages need that between groups, and a borrowed-iterator shape would
//! force draining every group up front to satisfy the borrow checker.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::model::SizeGroup;

/// Drives paginated `SizeGroup` retrieval across `vol_ids`, descending by
/// size. Call `next_group` in a loop until it returns `None`.
pub struct Grouper {
    vol_ids: Vec<i64>,
    window_size: usize,
    window_start: u64,
    pending: std::vec::IntoIter<u64>,
    exhausted: bool,
}

impl Grouper {
    pub fn new(vol_ids: Vec<i64>, window_size: usize) -> Self {
        Self {
            vol_ids,
            window_size,
            window_start: u64::MAX,
            pending: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    fn refill(&mut self, catalog: &Catalog) -> Result<()> {
        let sizes = catalog.size_keys_page(&self.vol_ids, self.window_start, self.window_size)?;
        match sizes.last() {
            // Next page starts just below the smallest size we saw, so we
            // never revisit it (sizes are unique rows coming out of the
            // GROUP BY, but pagination is inclusive at the boundary). Size 0
            // has no "one less than", so a page bottoming out at 0 is the
            // last page there is.
            Some(&0) | None => self.exhausted = true,
            Some(&smallest) => self.window_start = smallest - 1,
        }
        self.pending = sizes.into_iter();
        Ok(())
    }

    /// Returns the next `SizeGroup`, or `None` once every group has been
    /// yielded. Only ever materializes one page of size-keys and one
    /// group's inode membership at a time.
    pub fn next_group(&mut self, catalog: &Catalog) -> Result<Option<SizeGroup>> {
        loop {
            if let Some(size) = self.pending.next() {
                let inodes = catalog.inodes_for_size(&self.vol_ids, size)?;
                return Ok(Some(SizeGroup { size, inodes }));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.refill(catalog)?;
        }
    }
}
