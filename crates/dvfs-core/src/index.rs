//! Path index: store-backed lookup of records by path and by parent path.
//!
//! Multi-key operations (`rename`, `rename_tree`, `remove_tree`) are not
//! atomic. Copies are always written before originals are removed, so an
//! interruption leaves a duplicate rather than a hole; the reconciler
//! collapses duplicates against the live filesystem.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::paths;
use crate::record::{Record, Revision};
use crate::store::MetadataStore;

#[derive(Clone)]
pub struct PathIndex {
    store: Arc<dyn MetadataStore>,
}

impl PathIndex {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Wrap a store, creating the root directory record if it is missing.
    pub fn open(store: Arc<dyn MetadataStore>) -> FsResult<Self> {
        let index = Self::new(store);
        index.ensure_root()?;
        Ok(index)
    }

    pub fn ensure_root(&self) -> FsResult<()> {
        if self.store.get(paths::ROOT)?.is_some() {
            return Ok(());
        }
        match self.store.put(&Record::new_root(Utc::now()), None) {
            Ok(_) => {
                debug!("Created root directory record");
                Ok(())
            }
            // Another process initialized the store first.
            Err(FsError::Conflict) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn lookup(&self, path: &str) -> FsResult<Option<Record>> {
        self.store.get(path)
    }

    pub fn get(&self, path: &str) -> FsResult<Record> {
        self.store.get(path)?.ok_or(FsError::NotFound)
    }

    pub fn list_children(&self, parent: &str) -> FsResult<Vec<Record>> {
        self.store.list_children(parent)
    }

    /// Upsert guarded by the revision the record was read at.
    pub fn put(&self, record: &Record) -> FsResult<Revision> {
        self.store.put(record, record.revision)
    }

    /// Read-modify-write of one record. After a revision conflict the record
    /// is re-read and `apply` runs again, up to `retries` times.
    pub fn update<F>(&self, path: &str, retries: u32, mut apply: F) -> FsResult<Record>
    where
        F: FnMut(&mut Record) -> FsResult<()>,
    {
        let mut attempts = 0;
        loop {
            let mut record = self.get(path)?;
            apply(&mut record)?;
            match self.put(&record) {
                Ok(revision) => {
                    record.revision = Some(revision);
                    return Ok(record);
                }
                Err(FsError::Conflict) if attempts < retries => {
                    attempts += 1;
                    debug!("Conflict updating {}, re-reading", path);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Insert a record at a path that must currently be free.
    pub fn insert(&self, record: &Record) -> FsResult<Revision> {
        match self.store.put(record, None) {
            Err(FsError::Conflict) => Err(FsError::AlreadyExists),
            other => other,
        }
    }

    /// Delete a record. Returns the removed record, tombstoned.
    pub fn delete(&self, path: &str, expected: Revision) -> FsResult<Record> {
        let record = self.get(path)?;
        self.store.delete(path, expected)?;
        Ok(record.tombstone())
    }

    pub fn count(&self) -> FsResult<u64> {
        self.store.count()
    }

    /// Move a single record from `old` to `new`.
    pub fn rename(&self, old: &str, new: &str) -> FsResult<Record> {
        let record = self.get(old)?;
        if self.store.get(new)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mut copy = record.relocated(new);
        copy.revision = Some(self.insert(&copy)?);
        self.retire(&record, &mut copy)?;
        Ok(copy)
    }

    /// All records at and below `path`, each directory before its children.
    pub fn subtree(&self, path: &str) -> FsResult<Vec<Record>> {
        let mut out = Vec::new();
        let root = self.get(path)?;
        self.collect_subtree(root, &mut out)?;
        Ok(out)
    }

    fn collect_subtree(&self, record: Record, out: &mut Vec<Record>) -> FsResult<()> {
        let is_dir = record.is_dir();
        let path = record.path.clone();
        out.push(record);
        if is_dir {
            for child in self.list_children(&path)? {
                self.collect_subtree(child, out)?;
            }
        }
        Ok(())
    }

    /// Move a record and, for a directory, everything below it.
    pub fn rename_tree(&self, old: &str, new: &str) -> FsResult<Record> {
        if old == paths::ROOT || paths::is_within(new, old) {
            return Err(FsError::InvalidArgument);
        }
        if self.store.get(new)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let originals = self.subtree(old)?;
        let mut copies: Vec<Record> = Vec::with_capacity(originals.len());
        for original in &originals {
            let target = paths::rebase(&original.path, old, new).ok_or(FsError::InvalidArgument)?;
            let mut copy = original.relocated(target);
            match self.insert(&copy) {
                Ok(revision) => {
                    copy.revision = Some(revision);
                    copies.push(copy);
                }
                Err(e) => {
                    self.discard(&copies);
                    return Err(e);
                }
            }
        }

        let mut failure = None;
        for (original, copy) in originals.iter().zip(copies.iter_mut()).rev() {
            if let Err(e) = self.retire(original, copy) {
                warn!(
                    "Left duplicate {} after moving it to {}: {}",
                    original.path, copy.path, e
                );
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        copies.into_iter().next().ok_or(FsError::NotFound)
    }

    /// Delete a record and everything below it, deepest entries first.
    pub fn remove_tree(&self, path: &str) -> FsResult<Vec<Record>> {
        let records = self.subtree(path)?;
        let mut removed = Vec::with_capacity(records.len());
        for record in records.into_iter().rev() {
            match self.delete_fresh(&record) {
                Ok(gone) => removed.push(gone),
                Err(FsError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Delete `record`, re-reading once if it changed since it was fetched.
    pub(crate) fn delete_fresh(&self, record: &Record) -> FsResult<Record> {
        let revision = record.revision.ok_or(FsError::NotFound)?;
        match self.delete(&record.path, revision) {
            Err(FsError::Conflict) => {
                let latest = self.get(&record.path)?;
                let revision = latest.revision.ok_or(FsError::NotFound)?;
                self.delete(&record.path, revision)
            }
            other => other,
        }
    }

    /// Remove `original` now that `copy` holds its data. If the original
    /// changed in between, the copy is refreshed from it first.
    fn retire(&self, original: &Record, copy: &mut Record) -> FsResult<()> {
        let revision = original.revision.ok_or(FsError::NotFound)?;
        match self.store.delete(&original.path, revision) {
            Ok(()) => Ok(()),
            Err(FsError::Conflict) => {
                let latest = self.get(&original.path)?;
                let mut refreshed = latest.relocated(copy.path.clone());
                refreshed.revision = Some(self.store.put(&refreshed, copy.revision)?);
                let latest_revision = latest.revision.ok_or(FsError::NotFound)?;
                self.store.delete(&latest.path, latest_revision)?;
                *copy = refreshed;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn discard(&self, copies: &[Record]) {
        for copy in copies.iter().rev() {
            if let Some(revision) = copy.revision {
                if let Err(e) = self.store.delete(&copy.path, revision) {
                    warn!("Failed to discard partial copy {}: {}", copy.path, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FaultyStore;
    use crate::store::InMemoryStore;

    fn index() -> PathIndex {
        PathIndex::open(Arc::new(InMemoryStore::new())).unwrap()
    }

    fn add(index: &PathIndex, record: Record) {
        index.insert(&record).unwrap();
    }

    #[test]
    fn test_open_creates_root_once() {
        let store: Arc<dyn MetadataStore> = Arc::new(InMemoryStore::new());
        let index = PathIndex::open(store.clone()).unwrap();
        PathIndex::open(store).unwrap();

        let root = index.get("/").unwrap();
        assert_eq!(root.link_count(), Some(2));
        assert_eq!(index.count().unwrap(), 1);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        assert!(matches!(index().get("/missing"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_insert_existing_is_already_exists() {
        let index = index();
        let now = Utc::now();
        add(&index, Record::new_file("/f", 0o644, now));
        assert!(matches!(
            index.insert(&Record::new_file("/f", 0o644, now)),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn test_rename_moves_single_key() {
        let index = index();
        let now = Utc::now();
        let mut file = Record::new_file("/a", 0o644, now);
        file.set_content(10, "abc".into()).unwrap();
        add(&index, file);

        let moved = index.rename("/a", "/b").unwrap();
        assert_eq!(moved.path, "/b");
        assert_eq!(moved.size(), 10);
        assert!(index.lookup("/a").unwrap().is_none());
        assert_eq!(index.get("/b").unwrap().content_hash(), Some("abc"));
    }

    #[test]
    fn test_rename_errors() {
        let index = index();
        let now = Utc::now();
        add(&index, Record::new_file("/a", 0o644, now));
        add(&index, Record::new_file("/b", 0o644, now));

        assert!(matches!(index.rename("/x", "/y"), Err(FsError::NotFound)));
        assert!(matches!(index.rename("/a", "/b"), Err(FsError::AlreadyExists)));
        assert!(index.lookup("/a").unwrap().is_some());
    }

    #[test]
    fn test_rename_tree_moves_descendants() {
        let index = index();
        let now = Utc::now();
        add(&index, Record::new_directory("/d", 0o755, now));
        add(&index, Record::new_directory("/d/sub", 0o755, now));
        add(&index, Record::new_file("/d/sub/f", 0o644, now));
        add(&index, Record::new_file("/d/g", 0o644, now));

        let moved = index.rename_tree("/d", "/e").unwrap();
        assert_eq!(moved.path, "/e");

        let paths: Vec<String> = index
            .subtree("/e")
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(paths, vec!["/e", "/e/g", "/e/sub", "/e/sub/f"]);
        assert!(index.lookup("/d").unwrap().is_none());
        assert!(index.lookup("/d/sub/f").unwrap().is_none());
        assert!(index.list_children("/d").unwrap().is_empty());
    }

    #[test]
    fn test_rename_tree_reports_failed_retire() {
        let store = Arc::new(FaultyStore::new());
        let index = PathIndex::open(store.clone()).unwrap();
        let now = Utc::now();
        add(&index, Record::new_directory("/a", 0o755, now));
        add(&index, Record::new_file("/a/f", 0o644, now));
        store.fail_delete(Some("/a"));

        assert!(matches!(
            index.rename_tree("/a", "/b"),
            Err(FsError::StoreUnavailable(_))
        ));
        assert!(index.lookup("/a").unwrap().is_some());
        assert!(index.lookup("/b").unwrap().is_some());
        assert!(index.lookup("/a/f").unwrap().is_none());
    }

    #[test]
    fn test_rename_survives_concurrent_write() {
        let store = Arc::new(FaultyStore::new());
        let index = PathIndex::open(store.clone()).unwrap();
        add(&index, Record::new_file("/a", 0o600, Utc::now()));
        store.bump_before_delete(Some("/a"));

        let moved = index.rename("/a", "/b").unwrap();
        assert!(index.lookup("/a").unwrap().is_none());
        let stored = index.get("/b").unwrap();
        assert_eq!(stored.revision, moved.revision);
        assert_eq!(stored.mode & 0o777, 0o600);
        assert!(index.put(&moved).is_ok());
    }

    #[test]
    fn test_rename_tree_into_itself_is_rejected() {
        let index = index();
        add(&index, Record::new_directory("/d", 0o755, Utc::now()));
        assert!(matches!(
            index.rename_tree("/d", "/d/inner"),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn test_remove_tree_deepest_first() {
        let index = index();
        let now = Utc::now();
        add(&index, Record::new_directory("/d", 0o755, now));
        add(&index, Record::new_directory("/d/sub", 0o755, now));
        add(&index, Record::new_file("/d/sub/f", 0o644, now));

        let removed: Vec<String> = index
            .remove_tree("/d")
            .unwrap()
            .into_iter()
            .map(|r| {
                assert!(r.is_tombstoned());
                r.path
            })
            .collect();
        assert_eq!(removed, vec!["/d/sub/f", "/d/sub", "/d"]);
        assert_eq!(index.count().unwrap(), 1);
    }

    #[test]
    fn test_update_reapplies_after_conflict() {
        let index = index();
        index
            .insert(&Record::new_file("/f", 0o644, Utc::now()))
            .unwrap();

        let mut calls = 0;
        let updated = index
            .update("/f", 1, |record| {
                calls += 1;
                if calls == 1 {
                    // A competing writer lands between our read and our write.
                    let mut other = index.get("/f").unwrap();
                    other.uid = 7;
                    index.put(&other).unwrap();
                }
                record.gid = 9;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(updated.uid, 7);
        assert_eq!(updated.gid, 9);
    }

    #[test]
    fn test_update_gives_up_after_retries() {
        let index = index();
        index
            .insert(&Record::new_file("/f", 0o644, Utc::now()))
            .unwrap();

        let result = index.update("/f", 0, |_| {
            let other = index.get("/f").unwrap();
            index.put(&other).unwrap();
            Ok(())
        });
        assert!(matches!(result, Err(FsError::Conflict)));
    }

    #[test]
    fn test_delete_returns_tombstone() {
        let index = index();
        let rev = index
            .insert(&Record::new_file("/f", 0o644, Utc::now()))
            .unwrap();
        let gone = index.delete("/f", rev).unwrap();
        assert!(matches!(gone.to_attributes(), Err(FsError::NotFound)));
        assert!(matches!(index.delete("/f", rev), Err(FsError::NotFound)));
    }
}
