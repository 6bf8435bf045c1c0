//! Directory link-count bookkeeping.
//!
//! A directory's `link_count` is 2 plus the number of its immediate child
//! directories. Plain files never contribute.

use tracing::{debug, error, warn};

use crate::error::{FsError, FsResult};
use crate::index::PathIndex;
use crate::paths;
use crate::record::{Record, RecordKind};

#[derive(Clone)]
pub struct LinkCountMaintainer {
    index: PathIndex,
    conflict_retries: u32,
}

impl LinkCountMaintainer {
    pub fn new(index: PathIndex, conflict_retries: u32) -> Self {
        Self {
            index,
            conflict_retries,
        }
    }

    /// Apply `delta` to the directory at `directory`.
    ///
    /// A missing or non-directory target is an integrity error: the parent of
    /// any record must exist. A revision conflict re-reads the counter, so the
    /// delta lands exactly once.
    pub fn adjust(&self, directory: &str, delta: i32) -> FsResult<u32> {
        let mut attempts = 0;
        loop {
            let mut record = match self.index.get(directory) {
                Ok(record) => record,
                Err(FsError::NotFound) => {
                    error!("Link count target {} is missing", directory);
                    return Err(FsError::integrity(format!(
                        "directory {} missing during link count adjustment",
                        directory
                    )));
                }
                Err(e) => return Err(e),
            };

            let RecordKind::Directory { link_count } = &mut record.kind else {
                return Err(FsError::integrity(format!(
                    "link count target {} is not a directory",
                    directory
                )));
            };
            let updated = i64::from(*link_count) + i64::from(delta);
            if updated < 2 {
                return Err(FsError::integrity(format!(
                    "link count of {} would drop to {}",
                    directory, updated
                )));
            }
            *link_count = updated as u32;
            let new_count = *link_count;

            match self.index.put(&record) {
                Ok(_) => {
                    debug!("Link count of {} is now {}", directory, new_count);
                    return Ok(new_count);
                }
                Err(FsError::Conflict) if attempts < self.conflict_retries => {
                    attempts += 1;
                    debug!("Link count conflict on {}, retrying", directory);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bookkeeping for a directory moving from under `old_parent` to under `new_parent`.
    pub fn transfer(&self, old_parent: &str, new_parent: &str) -> FsResult<()> {
        if old_parent == new_parent {
            return Ok(());
        }
        self.adjust(old_parent, -1)?;
        if let Err(e) = self.adjust(new_parent, 1) {
            warn!("Restoring link count of {} after: {}", old_parent, e);
            if let Err(undo) = self.adjust(old_parent, 1) {
                error!("Link count of {} left one short: {}", old_parent, undo);
                return Err(FsError::integrity(format!(
                    "link counts of {} and {} left inconsistent: {}",
                    old_parent, new_parent, e
                )));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Move the directory tree at `old` to `new` and carry its parent link
    /// over. If the counters cannot follow, the tree is moved back.
    pub fn move_directory(&self, old: &str, new: &str) -> FsResult<Record> {
        let old_parent = paths::parent(old).ok_or(FsError::InvalidArgument)?;
        let new_parent = paths::parent(new).ok_or(FsError::InvalidArgument)?;

        let moved = self.index.rename_tree(old, new)?;
        if let Err(e) = self.transfer(old_parent, new_parent) {
            warn!("Moving {} back to {} after: {}", new, old, e);
            if let Err(undo) = self.index.rename_tree(new, old) {
                error!("Directory {} stranded at {}: {}", old, new, undo);
                return Err(FsError::integrity(format!(
                    "directory {} moved to {} without its link count: {}",
                    old, new, e
                )));
            }
            return Err(e);
        }
        Ok(moved)
    }
}
