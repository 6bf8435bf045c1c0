//! Store boundary: a path-keyed document store with per-key optimistic
//! versioning and one secondary index on parent path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::{FsError, FsResult};
use crate::paths;
use crate::record::{Record, Revision};

/// Backing store for records.
///
/// Every write names the revision the caller last read (`None` when the key
/// is expected to be absent); a stale revision is rejected with
/// [`FsError::Conflict`]. Writes replace a whole record or nothing.
pub trait MetadataStore: Send + Sync {
    /// Fetch by exact key. The returned record carries its current revision.
    fn get(&self, path: &str) -> FsResult<Option<Record>>;

    /// All records whose parent path equals `parent`, ordered by path.
    fn list_children(&self, parent: &str) -> FsResult<Vec<Record>>;

    fn put(&self, record: &Record, expected: Option<Revision>) -> FsResult<Revision>;

    fn delete(&self, path: &str, expected: Revision) -> FsResult<()>;

    fn count(&self) -> FsResult<u64>;
}

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, Record>,
    children: BTreeMap<String, BTreeSet<String>>,
    last_revision: u64,
}

/// In-memory store, used by tests and single-process mounts
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> FsResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| FsError::store(format!("failed to acquire store lock: {}", e)))
    }
}

impl MetadataStore for InMemoryStore {
    fn get(&self, path: &str) -> FsResult<Option<Record>> {
        let state = self.lock()?;
        Ok(state.records.get(path).cloned())
    }

    fn list_children(&self, parent: &str) -> FsResult<Vec<Record>> {
        let state = self.lock()?;
        let Some(names) = state.children.get(parent) else {
            return Ok(Vec::new());
        };
        Ok(names
            .iter()
            .filter_map(|path| state.records.get(path).cloned())
            .collect())
    }

    fn put(&self, record: &Record, expected: Option<Revision>) -> FsResult<Revision> {
        let mut state = self.lock()?;
        let current = state.records.get(&record.path).and_then(|r| r.revision);
        if current != expected {
            return Err(FsError::Conflict);
        }

        state.last_revision += 1;
        let revision = Revision::new(state.last_revision);
        let mut stored = record.clone();
        stored.revision = Some(revision);

        if current.is_none() {
            if let Some(parent) = paths::parent(&record.path) {
                state
                    .children
                    .entry(parent.to_string())
                    .or_default()
                    .insert(record.path.clone());
            }
        }
        state.records.insert(record.path.clone(), stored);
        Ok(revision)
    }

    fn delete(&self, path: &str, expected: Revision) -> FsResult<()> {
        let mut state = self.lock()?;
        let current = state
            .records
            .get(path)
            .ok_or(FsError::NotFound)?
            .revision;
        if current != Some(expected) {
            return Err(FsError::Conflict);
        }

        state.records.remove(path);
        if let Some(parent) = paths::parent(path) {
            if let Some(names) = state.children.get_mut(parent) {
                names.remove(path);
                if names.is_empty() {
                    state.children.remove(parent);
                }
            }
        }
        Ok(())
    }

    fn count(&self) -> FsResult<u64> {
        Ok(self.lock()?.records.len() as u64)
    }
}

/// Store wrapper that fails or races chosen keys.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Default)]
    pub(crate) struct FaultyStore {
        inner: InMemoryStore,
        fail_put: Mutex<Option<String>>,
        fail_delete: Mutex<Option<String>>,
        bump_before_delete: Mutex<Option<String>>,
    }

    impl FaultyStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Every put to `path` fails with `StoreUnavailable`.
        pub(crate) fn fail_put(&self, path: Option<&str>) {
            *self.fail_put.lock().unwrap() = path.map(str::to_string);
        }

        /// Every delete of `path` fails with `StoreUnavailable`.
        pub(crate) fn fail_delete(&self, path: Option<&str>) {
            *self.fail_delete.lock().unwrap() = path.map(str::to_string);
        }

        /// Rewrite `path` once, just before the next delete of it, as a
        /// concurrent attribute change would.
        pub(crate) fn bump_before_delete(&self, path: Option<&str>) {
            *self.bump_before_delete.lock().unwrap() = path.map(str::to_string);
        }

        fn matches(slot: &Mutex<Option<String>>, path: &str) -> bool {
            slot.lock().unwrap().as_deref() == Some(path)
        }
    }

    impl MetadataStore for FaultyStore {
        fn get(&self, path: &str) -> FsResult<Option<Record>> {
            self.inner.get(path)
        }

        fn list_children(&self, parent: &str) -> FsResult<Vec<Record>> {
            self.inner.list_children(parent)
        }

        fn put(&self, record: &Record, expected: Option<Revision>) -> FsResult<Revision> {
            if Self::matches(&self.fail_put, &record.path) {
                return Err(FsError::store(format!("injected put failure on {}", record.path)));
            }
            self.inner.put(record, expected)
        }

        fn delete(&self, path: &str, expected: Revision) -> FsResult<()> {
            if Self::matches(&self.fail_delete, path) {
                return Err(FsError::store(format!("injected delete failure on {}", path)));
            }
            let bump = {
                let mut slot = self.bump_before_delete.lock().unwrap();
                if slot.as_deref() == Some(path) {
                    slot.take()
                } else {
                    None
                }
            };
            if bump.is_some() {
                if let Some(current) = self.inner.get(path)? {
                    self.inner.put(&current, current.revision)?;
                }
            }
            self.inner.delete(path, expected)
        }

        fn count(&self) -> FsResult<u64> {
            self.inner.count()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_put_get_list() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.put(&Record::new_root(now), None).unwrap();
        store.put(&Record::new_file("/b.txt", 0o644, now), None).unwrap();
        store.put(&Record::new_directory("/a", 0o755, now), None).unwrap();
        store.put(&Record::new_file("/a/c.txt", 0o644, now), None).unwrap();

        let got = store.get("/a").unwrap().unwrap();
        assert!(got.is_dir());
        assert!(got.revision.is_some());

        let children: Vec<String> = store
            .list_children("/")
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(children, vec!["/a", "/b.txt"]);
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn test_stale_revision_is_rejected() {
        let store = InMemoryStore::new();
        let file = Record::new_file("/f", 0o644, Utc::now());
        let first = store.put(&file, None).unwrap();
        let second = store.put(&file, Some(first)).unwrap();
        assert!(second > first);

        assert!(matches!(store.put(&file, Some(first)), Err(FsError::Conflict)));
        assert!(matches!(store.put(&file, None), Err(FsError::Conflict)));
        assert!(matches!(store.delete("/f", first), Err(FsError::Conflict)));
        store.delete("/f", second).unwrap();
        assert!(matches!(store.delete("/f", second), Err(FsError::NotFound)));
    }

    #[test]
    fn test_update_against_deleted_key_conflicts() {
        let store = InMemoryStore::new();
        let file = Record::new_file("/f", 0o644, Utc::now());
        let rev = store.put(&file, None).unwrap();
        store.delete("/f", rev).unwrap();
        assert!(matches!(store.put(&file, Some(rev)), Err(FsError::Conflict)));
        assert!(store.list_children("/").unwrap().is_empty());
    }

    #[test]
    fn test_revisions_never_reused_after_delete() {
        let store = InMemoryStore::new();
        let file = Record::new_file("/f", 0o644, Utc::now());
        let rev = store.put(&file, None).unwrap();
        store.delete("/f", rev).unwrap();
        let again = store.put(&file, None).unwrap();
        assert_ne!(rev, again);
    }
}
