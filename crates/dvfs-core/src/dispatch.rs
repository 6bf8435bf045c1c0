//! Operation dispatcher: one handler per filesystem call.
//!
//! Handlers compose the path index, the link-count maintainer and local byte
//! storage. Field-level changes (size, hash, timestamps, mode, owner, xattrs)
//! re-read and re-apply after a revision conflict; structural changes
//! (mkdir, rmdir, rename) report the conflict instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::DvfsConfig;
use crate::error::{FsError, FsResult};
use crate::index::PathIndex;
use crate::links::LinkCountMaintainer;
use crate::local::ByteStorage;
use crate::paths;
use crate::record::{Attributes, DirEntry, EntryKind, FsStats, Record};
use crate::store::MetadataStore;

const BLOCK_SIZE: u32 = 512;
const TOTAL_BLOCKS: u64 = 4096;
const AVAILABLE_BLOCKS: u64 = 2048;
const NAME_MAX: u32 = 255;

pub struct Dispatcher {
    config: DvfsConfig,
    index: PathIndex,
    links: LinkCountMaintainer,
    storage: Arc<dyn ByteStorage>,
    next_handle: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: DvfsConfig,
        store: Arc<dyn MetadataStore>,
        storage: Arc<dyn ByteStorage>,
    ) -> FsResult<Self> {
        let index = PathIndex::open(store)?;
        let links = LinkCountMaintainer::new(index.clone(), config.conflict_retries);
        Ok(Self {
            config,
            index,
            links,
            storage,
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DvfsConfig {
        &self.config
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }

    /// Normalized path plus the path of its (existing) parent directory.
    fn with_parent(&self, path: &str) -> FsResult<(String, String)> {
        let path = paths::normalize(path)?;
        let parent = paths::parent(&path)
            .ok_or(FsError::InvalidArgument)?
            .to_string();
        let parent_record = self.index.get(&parent)?;
        if !parent_record.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok((path, parent))
    }

    fn file_record(&self, path: &str) -> FsResult<Record> {
        let record = self.index.get(path)?;
        if record.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(record)
    }

    fn directory_record(&self, path: &str) -> FsResult<Record> {
        let record = self.index.get(path)?;
        if !record.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(record)
    }

    fn update_fields<F>(&self, path: &str, apply: F) -> FsResult<Record>
    where
        F: FnMut(&mut Record) -> FsResult<()>,
    {
        self.index.update(path, self.config.conflict_retries, apply)
    }

    /// Refresh size and hash from the local byte copy.
    fn sync_content(&self, path: &str) -> FsResult<Record> {
        self.update_fields(path, |record| {
            let stat = self.storage.stat(path)?.ok_or(FsError::NotFound)?;
            record.set_content(stat.size, stat.content_hash)?;
            record.modified_at = Utc::now();
            Ok(())
        })
    }

    pub fn getattr(&self, path: &str) -> FsResult<Attributes> {
        let path = paths::normalize(path)?;
        self.index.get(&path)?.to_attributes()
    }

    pub fn create(&self, path: &str, mode: u32) -> FsResult<Attributes> {
        let (path, _) = self.with_parent(path)?;
        debug!("create {}", path);
        if self.index.lookup(&path)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        self.storage.create_file(&path)?;
        let mut record = Record::new_file(path, mode, Utc::now());
        record.revision = Some(self.index.insert(&record)?);
        record.to_attributes()
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> FsResult<Attributes> {
        let (path, parent) = self.with_parent(path)?;
        debug!("mkdir {}", path);
        if self.index.lookup(&path)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        self.storage.create_dir(&path)?;
        let mut record = Record::new_directory(path.as_str(), mode, Utc::now());
        let revision = self.index.insert(&record)?;
        record.revision = Some(revision);

        if let Err(e) = self.links.adjust(&parent, 1) {
            warn!("Rolling back mkdir {}: {}", path, e);
            if let Err(undo) = self.index.delete(&path, revision) {
                warn!("Rollback of {} failed: {}", path, undo);
            }
            if let Err(undo) = self.storage.remove_dir(&path) {
                warn!("Failed to remove local directory {}: {}", path, undo);
            }
            return Err(e);
        }
        record.to_attributes()
    }

    /// Verify the target exists and hand out a handle number.
    pub fn open(&self, path: &str) -> FsResult<u64> {
        let path = paths::normalize(path)?;
        self.index.get(&path)?;
        Ok(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub fn read(&self, path: &str, size: usize, offset: u64) -> FsResult<Vec<u8>> {
        let path = paths::normalize(path)?;
        self.file_record(&path)?;
        self.storage.read_at(&path, offset, size)
    }

    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> FsResult<usize> {
        let path = paths::normalize(path)?;
        self.file_record(&path)?;
        let written = self.storage.write_at(&path, offset, data)?;
        self.sync_content(&path)?;
        Ok(written)
    }

    pub fn truncate(&self, path: &str, length: u64) -> FsResult<()> {
        let path = paths::normalize(path)?;
        self.file_record(&path)?;
        self.storage.truncate(&path, length)?;
        self.sync_content(&path)?;
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let old = paths::normalize(old)?;
        if old == paths::ROOT {
            return Err(FsError::InvalidArgument);
        }
        let (new, _) = self.with_parent(new)?;
        let record = self.index.get(&old)?;
        if old == new {
            return Ok(());
        }
        debug!("rename {} -> {}", old, new);

        if record.is_dir() {
            self.links.move_directory(&old, &new)?;
        } else {
            self.index.rename(&old, &new)?;
        }

        if let Err(e) = self.storage.rename(&old, &new) {
            warn!("Local rename {} -> {} failed: {}", old, new, e);
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let path = paths::normalize(path)?;
        debug!("unlink {}", path);
        let record = self.file_record(&path)?;

        match self.storage.remove(&path) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Local copy of {} already gone", path),
            Err(e) => return Err(e),
        }

        match self.index.delete_fresh(&record) {
            Ok(_) | Err(FsError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let path = paths::normalize(path)?;
        let parent = paths::parent(&path)
            .ok_or(FsError::InvalidArgument)?
            .to_string();
        debug!("rmdir {}", path);

        let record = self.directory_record(&path)?;
        if !self.index.list_children(&path)?.is_empty() {
            return Err(FsError::NotEmpty);
        }

        let revision = record.revision.ok_or(FsError::NotFound)?;
        self.index.delete(&path, revision)?;
        self.links.adjust(&parent, -1)?;

        match self.storage.remove_dir(&path) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Local rmdir {} failed: {}", path, e),
        }
        Ok(())
    }

    /// Entry names, `.` and `..` first.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = paths::normalize(path)?;
        self.directory_record(&path)?;

        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                kind: EntryKind::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                kind: EntryKind::Directory,
            },
        ];
        entries.extend(self.index.list_children(&path)?.into_iter().map(|child| DirEntry {
            name: paths::base_name(&child.path).to_string(),
            kind: child.entry_kind(),
        }));
        Ok(entries)
    }

    /// Set timestamps on the record only. `None` leaves a timestamp unchanged.
    pub fn utimens(
        &self,
        path: &str,
        atime: Option<DateTime<Utc>>,
        mtime: Option<DateTime<Utc>>,
    ) -> FsResult<()> {
        let path = paths::normalize(path)?;
        self.update_fields(&path, |record| {
            if let Some(atime) = atime {
                record.accessed_at = atime;
            }
            if let Some(mtime) = mtime {
                record.modified_at = mtime;
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let path = paths::normalize(path)?;
        self.update_fields(&path, |record| {
            record.set_permissions(mode);
            Ok(())
        })?;
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let path = paths::normalize(path)?;
        self.update_fields(&path, |record| {
            if let Some(uid) = uid {
                record.uid = uid;
            }
            if let Some(gid) = gid {
                record.gid = gid;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn require_xattrs(&self) -> FsResult<()> {
        if self.config.enable_xattrs {
            Ok(())
        } else {
            Err(FsError::Unsupported)
        }
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> FsResult<()> {
        self.require_xattrs()?;
        let path = paths::normalize(path)?;
        self.update_fields(&path, |record| {
            record.xattrs.insert(name.to_string(), value.to_vec());
            Ok(())
        })?;
        Ok(())
    }

    pub fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        self.require_xattrs()?;
        let path = paths::normalize(path)?;
        let record = self.index.get(&path)?;
        record.xattrs.get(name).cloned().ok_or(FsError::NoAttribute)
    }

    pub fn listxattr(&self, path: &str) -> FsResult<Vec<String>> {
        self.require_xattrs()?;
        let path = paths::normalize(path)?;
        Ok(self.index.get(&path)?.xattrs.into_keys().collect())
    }

    pub fn removexattr(&self, path: &str, name: &str) -> FsResult<()> {
        self.require_xattrs()?;
        let path = paths::normalize(path)?;
        self.update_fields(&path, |record| {
            record
                .xattrs
                .remove(name)
                .map(|_| ())
                .ok_or(FsError::NoAttribute)
        })?;
        Ok(())
    }

    pub fn statfs(&self) -> FsResult<FsStats> {
        Ok(FsStats {
            block_size: BLOCK_SIZE,
            blocks: TOTAL_BLOCKS,
            blocks_free: AVAILABLE_BLOCKS,
            blocks_available: AVAILABLE_BLOCKS,
            files: self.index.count()?,
            name_max: NAME_MAX,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{content_hash, LocalDiskStorage};
    use crate::store::testing::FaultyStore;
    use crate::store::InMemoryStore;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Dispatcher) {
        let dir = tempdir().unwrap();
        let dispatcher = Dispatcher::new(
            DvfsConfig::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(LocalDiskStorage::new(dir.path())),
        )
        .unwrap();
        (dir, dispatcher)
    }

    fn faulty_setup() -> (TempDir, Arc<FaultyStore>, Dispatcher) {
        let dir = tempdir().unwrap();
        let store = Arc::new(FaultyStore::new());
        let dispatcher = Dispatcher::new(
            DvfsConfig::default(),
            store.clone(),
            Arc::new(LocalDiskStorage::new(dir.path())),
        )
        .unwrap();
        (dir, store, dispatcher)
    }

    fn names(entries: Vec<DirEntry>) -> Vec<String> {
        entries.into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn test_create_writes_local_file_and_record() {
        let (dir, fs) = setup();
        let attrs = fs.create("/f.txt", 0o644).unwrap();
        assert_eq!(attrs.kind, EntryKind::File);
        assert_eq!(attrs.size, 0);
        assert!(dir.path().join("f.txt").exists());
        assert_eq!(fs.getattr("/").unwrap().nlink, 2);
    }

    #[test]
    fn test_create_twice_is_already_exists() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        assert!(matches!(fs.create("/f", 0o644), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn test_create_under_missing_parent() {
        let (_dir, fs) = setup();
        assert!(matches!(fs.create("/nope/f", 0o644), Err(FsError::NotFound)));
        fs.create("/file", 0o644).unwrap();
        assert!(matches!(
            fs.create("/file/f", 0o644),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn test_mkdir_bumps_parent_link_count() {
        let (dir, fs) = setup();
        fs.mkdir("/a", 0o755).unwrap();
        assert!(dir.path().join("a").is_dir());
        assert_eq!(fs.getattr("/").unwrap().nlink, 3);
        assert_eq!(fs.getattr("/a").unwrap().nlink, 2);
    }

    #[test]
    fn test_write_updates_size_and_hash() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        assert_eq!(fs.write("/f", b"hello", 0).unwrap(), 5);
        assert_eq!(fs.write("/f", b" world", 5).unwrap(), 6);

        let record = fs.index().get("/f").unwrap();
        assert_eq!(record.size(), 11);
        assert_eq!(record.content_hash(), Some(content_hash(b"hello world").as_str()));
        assert_eq!(fs.read("/f", 5, 6).unwrap(), b"world");
    }

    #[test]
    fn test_truncate_recomputes_hash() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        fs.write("/f", b"hello world", 0).unwrap();
        fs.truncate("/f", 0).unwrap();

        let record = fs.index().get("/f").unwrap();
        assert_eq!(record.size(), 0);
        assert_eq!(record.content_hash(), Some(""));
    }

    #[test]
    fn test_read_and_write_reject_directories() {
        let (_dir, fs) = setup();
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(fs.read("/d", 1, 0), Err(FsError::IsADirectory)));
        assert!(matches!(fs.write("/d", b"x", 0), Err(FsError::IsADirectory)));
        assert!(matches!(fs.unlink("/d"), Err(FsError::IsADirectory)));
        assert!(matches!(fs.read("/missing", 1, 0), Err(FsError::NotFound)));
    }

    #[test]
    fn test_rmdir_non_empty_leaves_store_untouched() {
        let (_dir, fs) = setup();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();
        let before = fs.index().count().unwrap();

        assert!(matches!(fs.rmdir("/d"), Err(FsError::NotEmpty)));
        assert_eq!(fs.index().count().unwrap(), before);
        assert_eq!(fs.getattr("/").unwrap().nlink, 3);
    }

    #[test]
    fn test_rmdir_restores_parent_link_count() {
        let (dir, fs) = setup();
        fs.mkdir("/d", 0o755).unwrap();
        fs.rmdir("/d").unwrap();
        assert_eq!(fs.getattr("/").unwrap().nlink, 2);
        assert!(!dir.path().join("d").exists());
        assert!(matches!(fs.rmdir("/"), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn test_readdir_lists_dot_entries_first() {
        let (_dir, fs) = setup();
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/b", 0o644).unwrap();
        fs.mkdir("/d/a", 0o755).unwrap();
        assert_eq!(names(fs.readdir("/d").unwrap()), vec![".", "..", "a", "b"]);
        assert!(matches!(fs.readdir("/d/b"), Err(FsError::NotADirectory)));
    }

    #[test]
    fn test_rename_directory_across_parents() {
        let (dir, fs) = setup();
        fs.mkdir("/a", 0o755).unwrap();
        fs.mkdir("/b", 0o755).unwrap();
        fs.mkdir("/a/sub", 0o755).unwrap();
        fs.create("/a/sub/f", 0o644).unwrap();

        fs.rename("/a/sub", "/b/sub").unwrap();
        assert_eq!(fs.getattr("/a").unwrap().nlink, 2);
        assert_eq!(fs.getattr("/b").unwrap().nlink, 3);
        assert_eq!(fs.getattr("/b/sub").unwrap().nlink, 2);
        assert!(fs.getattr("/b/sub/f").is_ok());
        assert!(matches!(fs.getattr("/a/sub/f"), Err(FsError::NotFound)));
        assert!(dir.path().join("b/sub/f").exists());
    }

    #[test]
    fn test_rename_onto_existing_target() {
        let (_dir, fs) = setup();
        fs.create("/a", 0o644).unwrap();
        fs.create("/b", 0o644).unwrap();
        assert!(matches!(fs.rename("/a", "/b"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn test_utimens_sets_only_given_fields() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        let before = fs.index().get("/f").unwrap();
        let when = DateTime::parse_from_rfc3339("2001-02-03T04:05:06Z")
            .unwrap()
            .with_timezone(&Utc);

        fs.utimens("/f", None, Some(when)).unwrap();
        let after = fs.index().get("/f").unwrap();
        assert_eq!(after.modified_at, when);
        assert_eq!(after.accessed_at, before.accessed_at);
    }

    #[test]
    fn test_chmod_and_chown() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        fs.chmod("/f", 0o600).unwrap();
        fs.chown("/f", Some(1000), None).unwrap();

        let attrs = fs.getattr("/f").unwrap();
        assert_eq!(attrs.permissions(), 0o600);
        assert_eq!(attrs.uid, 1000);
        assert_eq!(attrs.gid, 0);
        assert_eq!(attrs.kind, EntryKind::File);
    }

    #[test]
    fn test_xattrs_pass_through() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        fs.setxattr("/f", "user.color", b"blue").unwrap();

        assert_eq!(fs.getxattr("/f", "user.color").unwrap(), b"blue");
        assert_eq!(fs.listxattr("/f").unwrap(), vec!["user.color"]);
        fs.removexattr("/f", "user.color").unwrap();
        assert!(matches!(
            fs.getxattr("/f", "user.color"),
            Err(FsError::NoAttribute)
        ));
        assert!(matches!(
            fs.removexattr("/f", "user.color"),
            Err(FsError::NoAttribute)
        ));
    }

    #[test]
    fn test_xattrs_disabled() {
        let dir = tempdir().unwrap();
        let config = DvfsConfig {
            enable_xattrs: false,
            ..DvfsConfig::default()
        };
        let fs = Dispatcher::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(LocalDiskStorage::new(dir.path())),
        )
        .unwrap();
        assert!(matches!(fs.listxattr("/"), Err(FsError::Unsupported)));
    }

    #[test]
    fn test_statfs_counts_records() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        let stats = fs.statfs().unwrap();
        assert_eq!(stats.block_size, 512);
        assert_eq!(stats.blocks, 4096);
        assert_eq!(stats.blocks_available, 2048);
        assert_eq!(stats.files, 2);
    }

    #[test]
    fn test_open_hands_out_distinct_handles() {
        let (_dir, fs) = setup();
        fs.create("/f", 0o644).unwrap();
        let a = fs.open("/f").unwrap();
        let b = fs.open("/f").unwrap();
        assert_ne!(a, b);
        assert!(matches!(fs.open("/missing"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_mkdir_rolls_back_when_parent_count_fails() {
        let (dir, store, fs) = faulty_setup();
        store.fail_put(Some("/"));

        assert!(matches!(fs.mkdir("/d", 0o755), Err(FsError::StoreUnavailable(_))));
        assert!(matches!(fs.getattr("/d"), Err(FsError::NotFound)));
        assert!(!dir.path().join("d").exists());

        store.fail_put(None);
        assert_eq!(fs.getattr("/").unwrap().nlink, 2);
        fs.mkdir("/d", 0o755).unwrap();
        assert_eq!(fs.getattr("/").unwrap().nlink, 3);
    }

    #[test]
    fn test_rmdir_reports_concurrent_change() {
        let (dir, store, fs) = faulty_setup();
        fs.mkdir("/d", 0o755).unwrap();
        store.bump_before_delete(Some("/d"));

        assert!(matches!(fs.rmdir("/d"), Err(FsError::Conflict)));
        assert!(fs.getattr("/d").is_ok());
        assert!(dir.path().join("d").is_dir());
        assert_eq!(fs.getattr("/").unwrap().nlink, 3);

        fs.rmdir("/d").unwrap();
        assert_eq!(fs.getattr("/").unwrap().nlink, 2);
    }

    #[test]
    fn test_rename_directory_fails_cleanly_when_counts_fail() {
        let (dir, store, fs) = faulty_setup();
        fs.mkdir("/x", 0o755).unwrap();
        fs.mkdir("/y", 0o755).unwrap();
        fs.mkdir("/x/sub", 0o755).unwrap();
        store.fail_put(Some("/y"));

        assert!(fs.rename("/x/sub", "/y/sub").is_err());
        assert!(fs.getattr("/x/sub").is_ok());
        assert!(matches!(fs.getattr("/y/sub"), Err(FsError::NotFound)));
        assert!(dir.path().join("x/sub").is_dir());
        assert_eq!(fs.getattr("/x").unwrap().nlink, 3);
        assert_eq!(fs.getattr("/y").unwrap().nlink, 2);
    }

    #[test]
    fn test_rename_directory_fails_when_original_cannot_be_removed() {
        let (_dir, store, fs) = faulty_setup();
        fs.mkdir("/a", 0o755).unwrap();
        store.fail_delete(Some("/a"));

        assert!(matches!(fs.rename("/a", "/b"), Err(FsError::StoreUnavailable(_))));
        assert_eq!(fs.getattr("/").unwrap().nlink, 3);
    }
}
