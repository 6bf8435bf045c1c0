//! Reconciler: applies filesystem changes observed by an external watcher to
//! the same path index the dispatcher writes.
//!
//! Notifications are delivered at least once and may race with dispatcher
//! calls on the same paths. Every step re-checks both the index and the live
//! filesystem, so duplicates and already-applied changes fall through to a
//! no-op. A failing notification is logged and dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::DvfsConfig;
use crate::error::{FsError, FsResult};
use crate::index::PathIndex;
use crate::links::LinkCountMaintainer;
use crate::local::{ByteStorage, ContentStat};
use crate::paths;
use crate::record::{EntryKind, Record};
use crate::store::MetadataStore;

/// A change observed on the live filesystem, with store-style paths
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    Created { path: String, kind: EntryKind },
    Deleted { path: String },
    Modified { path: String },
    Moved { src: String, dst: String },
}

impl ChangeEvent {
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Created { path, .. }
            | ChangeEvent::Deleted { path }
            | ChangeEvent::Modified { path } => path,
            ChangeEvent::Moved { dst, .. } => dst,
        }
    }
}

/// What applying one notification did to the index
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Updated,
    /// Number of records removed.
    Removed(usize),
    Moved,
    /// Duplicate records for one entry were folded into one.
    Collapsed,
    Skipped(&'static str),
}

/// Counts from a full tree resync
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct Reconciler {
    config: DvfsConfig,
    index: PathIndex,
    links: LinkCountMaintainer,
    storage: Arc<dyn ByteStorage>,
}

impl Reconciler {
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
        })
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }

    /// Apply one notification. Failures are logged, never propagated.
    pub fn apply(&self, event: &ChangeEvent) {
        match self.try_apply(event) {
            Ok(outcome) => debug!("Reconciled {:?}: {:?}", event, outcome),
            Err(e) => error!("Dropping notification {:?}: {}", event, e),
        }
    }

    /// Apply notifications strictly in order.
    pub fn run<I>(&self, events: I)
    where
        I: IntoIterator<Item = ChangeEvent>,
    {
        for event in events {
            self.apply(&event);
        }
    }

    pub fn try_apply(&self, event: &ChangeEvent) -> FsResult<Outcome> {
        let result = match event {
            ChangeEvent::Created { path, kind } => self.created(&paths::normalize(path)?, *kind),
            ChangeEvent::Deleted { path } => self.deleted(&paths::normalize(path)?),
            ChangeEvent::Modified { path } => self.modified(&paths::normalize(path)?),
            ChangeEvent::Moved { src, dst } => {
                self.moved(&paths::normalize(src)?, &paths::normalize(dst)?)
            }
        };
        match result {
            Err(FsError::NotFound) => Ok(Outcome::Skipped("entry vanished")),
            other => other,
        }
    }

    fn created(&self, path: &str, kind: EntryKind) -> FsResult<Outcome> {
        if path == paths::ROOT {
            return Ok(Outcome::Skipped("root"));
        }
        if self.index.lookup(path)?.is_some() {
            return self.modified(path);
        }
        let Some(live) = self.storage.stat(path)? else {
            return Ok(Outcome::Skipped("no live entry"));
        };
        if live.kind != kind {
            debug!("{} reported as {:?} but is {:?}", path, kind, live.kind);
        }

        self.ensure_parent(path)?;
        match self.insert_live(path, &live) {
            Ok(()) => {}
            // Lost the race to the dispatcher.
            Err(FsError::AlreadyExists) => return self.modified(path),
            Err(e) => return Err(e),
        }

        if live.kind == EntryKind::Directory {
            let summary = self.resync(path)?;
            if summary.failed > 0 {
                warn!("{} entries under {} failed to reconcile", summary.failed, path);
            }
        }
        Ok(Outcome::Inserted)
    }

    fn deleted(&self, path: &str) -> FsResult<Outcome> {
        if path == paths::ROOT {
            return Ok(Outcome::Skipped("root"));
        }
        let Some(record) = self.index.lookup(path)? else {
            return Ok(Outcome::Skipped("already removed"));
        };

        if let Some(live) = self.storage.stat(path)? {
            if live.kind == record.entry_kind() {
                // Stale or reordered notification; the entry is back.
                return self.modified(path);
            }
            self.remove_record(&record)?;
            self.ensure_parent(path)?;
            self.insert_live(path, &live)?;
            return Ok(Outcome::Updated);
        }

        Ok(Outcome::Removed(self.remove_record(&record)?))
    }

    fn modified(&self, path: &str) -> FsResult<Outcome> {
        let Some(record) = self.index.lookup(path)? else {
            return Ok(Outcome::Skipped("no record"));
        };
        let Some(live) = self.storage.stat(path)? else {
            return Ok(Outcome::Skipped("no live entry"));
        };
        if live.kind != record.entry_kind() {
            self.remove_record(&record)?;
            self.ensure_parent(path)?;
            self.insert_live(path, &live)?;
            return Ok(Outcome::Updated);
        }
        if Self::matches_live(&record, &live) {
            return Ok(Outcome::Skipped("unchanged"));
        }

        self.index.update(path, self.config.conflict_retries, |record| {
            // Stat inside the closure so a retry sees the latest bytes.
            let live = self.storage.stat(path)?.ok_or(FsError::NotFound)?;
            if live.kind == EntryKind::File {
                record.set_content(live.size, live.content_hash)?;
            }
            record.modified_at = live.modified;
            Ok(())
        })?;
        Ok(Outcome::Updated)
    }

    fn moved(&self, src: &str, dst: &str) -> FsResult<Outcome> {
        if src == dst {
            return self.modified(dst);
        }
        let src_record = self.index.lookup(src)?;
        let dst_record = self.index.lookup(dst)?;
        let live = self.storage.stat(dst)?;

        match (src_record, dst_record, live) {
            (None, Some(_), _) => {
                // Already moved, most likely by the dispatcher.
                self.modified(dst)
            }
            (None, None, Some(live)) => self.created(dst, live.kind),
            (None, None, None) => Ok(Outcome::Skipped("nothing to move")),
            (Some(src_record), None, _) => {
                self.ensure_parent(dst)?;
                if src_record.is_dir() {
                    self.links.move_directory(src, dst)?;
                } else {
                    self.index.rename(src, dst)?;
                    if let Err(e) = self.modified(dst) {
                        warn!("Could not refresh {} after move: {}", dst, e);
                    }
                }
                Ok(Outcome::Moved)
            }
            (Some(src_record), Some(dst_record), live) => {
                self.collapse(&src_record, &dst_record, live)
            }
        }
    }

    /// Both `src` and `dst` hold a record for what is now one live entry.
    /// The record whose content hash matches the live file at `dst` wins.
    fn collapse(
        &self,
        src_record: &Record,
        dst_record: &Record,
        live: Option<ContentStat>,
    ) -> FsResult<Outcome> {
        let dst = dst_record.path.as_str();
        info!("Collapsing duplicate records {} and {}", src_record.path, dst);

        let Some(live) = live else {
            self.remove_record(src_record)?;
            return Ok(Outcome::Collapsed);
        };

        let same_kind = src_record.entry_kind() == live.kind && dst_record.entry_kind() == live.kind;
        if same_kind && live.kind == EntryKind::File {
            let src_matches = src_record.content_hash() == Some(live.content_hash.as_str());
            let dst_matches = dst_record.content_hash() == Some(live.content_hash.as_str());
            if src_matches && !dst_matches {
                let mut winner = src_record.relocated(dst);
                winner.revision = dst_record.revision;
                self.index.put(&winner)?;
            }
            self.remove_record(src_record)?;
            if let Err(e) = self.modified(dst) {
                warn!("Could not refresh {} after collapse: {}", dst, e);
            }
            return Ok(Outcome::Collapsed);
        }

        self.remove_record(src_record)?;
        if dst_record.entry_kind() != live.kind {
            self.remove_record(dst_record)?;
            self.ensure_parent(dst)?;
            self.insert_live(dst, &live)?;
        }
        if live.kind == EntryKind::Directory {
            self.resync(dst)?;
        }
        Ok(Outcome::Collapsed)
    }

    /// Walk the live tree at `path` and bring the index in line with it.
    pub fn resync(&self, path: &str) -> FsResult<ResyncSummary> {
        let path = paths::normalize(path)?;
        let mut summary = ResyncSummary::default();
        self.resync_path(&path, &mut summary)?;
        Ok(summary)
    }

    fn resync_path(&self, path: &str, summary: &mut ResyncSummary) -> FsResult<()> {
        let live = self.storage.stat(path)?;
        let record = self.index.lookup(path)?;

        let kind = match (record, live) {
            (None, None) => return Ok(()),
            (Some(record), None) => {
                if path != paths::ROOT {
                    summary.removed += self.remove_record(&record)?;
                }
                return Ok(());
            }
            (None, Some(live)) => {
                self.ensure_parent(path)?;
                match self.insert_live(path, &live) {
                    Ok(()) => summary.inserted += 1,
                    Err(FsError::AlreadyExists) => {}
                    Err(e) => return Err(e),
                }
                live.kind
            }
            (Some(record), Some(live)) => {
                if record.entry_kind() != live.kind {
                    summary.removed += self.remove_record(&record)?;
                    self.ensure_parent(path)?;
                    self.insert_live(path, &live)?;
                    summary.inserted += 1;
                } else if live.kind == EntryKind::File
                    && !Self::matches_live(&record, &live)
                    && self.modified(path)? == Outcome::Updated
                {
                    summary.updated += 1;
                }
                live.kind
            }
        };

        if kind != EntryKind::Directory {
            return Ok(());
        }

        let mut names: BTreeSet<String> = self
            .storage
            .list_dir(path)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        for child in self.index.list_children(path)? {
            names.insert(paths::base_name(&child.path).to_string());
        }
        for name in names {
            let child = paths::join(path, &name);
            if let Err(e) = self.resync_path(&child, summary) {
                warn!("Resync of {} failed: {}", child, e);
                summary.failed += 1;
            }
        }
        Ok(())
    }

    fn matches_live(record: &Record, live: &ContentStat) -> bool {
        match live.kind {
            EntryKind::File => {
                record.size() == live.size
                    && record.content_hash() == Some(live.content_hash.as_str())
            }
            EntryKind::Directory => record.modified_at == live.modified,
        }
    }

    /// Make sure the parent of `path` has a record, creating it from the
    /// live filesystem when it exists there.
    fn ensure_parent(&self, path: &str) -> FsResult<()> {
        let parent = paths::parent(path).ok_or(FsError::InvalidArgument)?;
        match self.index.lookup(parent)? {
            Some(record) if record.is_dir() => Ok(()),
            Some(_) => Err(FsError::NotADirectory),
            None => {
                let live = self.storage.stat(parent)?.ok_or(FsError::NotFound)?;
                if live.kind != EntryKind::Directory {
                    return Err(FsError::NotADirectory);
                }
                self.ensure_parent(parent)?;
                match self.insert_live(parent, &live) {
                    Ok(()) | Err(FsError::AlreadyExists) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Insert a record mirroring `live`, with the parent link count bumped
    /// for directories.
    fn insert_live(&self, path: &str, live: &ContentStat) -> FsResult<()> {
        let mut record = match live.kind {
            EntryKind::Directory => {
                Record::new_directory(path, self.config.default_dir_mode, live.modified)
            }
            EntryKind::File => {
                let mut record =
                    Record::new_file(path, self.config.default_file_mode, live.modified);
                record.set_content(live.size, live.content_hash.clone())?;
                record
            }
        };
        let revision = self.index.insert(&record)?;
        record.revision = Some(revision);

        if record.is_dir() {
            let parent = paths::parent(path).ok_or(FsError::InvalidArgument)?;
            if let Err(e) = self.links.adjust(parent, 1) {
                if let Err(undo) = self.index.delete(path, revision) {
                    warn!("Rollback of {} failed: {}", path, undo);
                }
                return Err(e);
            }
        }
        debug!("Inserted {} from live filesystem", path);
        Ok(())
    }

    /// Remove a record (and its subtree), fixing the parent link count.
    fn remove_record(&self, record: &Record) -> FsResult<usize> {
        if !record.is_dir() {
            return match self.index.delete_fresh(record) {
                Ok(_) => Ok(1),
                Err(FsError::NotFound) => Ok(0),
                Err(e) => Err(e),
            };
        }

        let removed = self.index.remove_tree(&record.path)?;
        if removed.iter().any(|r| r.path == record.path) {
            let parent = paths::parent(&record.path).ok_or(FsError::InvalidArgument)?;
            self.links.adjust(parent, -1)?;
        }
        Ok(removed.len())
    }
}
