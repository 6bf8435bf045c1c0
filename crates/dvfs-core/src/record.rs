//! Record model: the stored metadata for one filesystem path

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Opaque per-key version token handed out by the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// Variant-specific fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RecordKind {
    File { size: u64, content_hash: String },
    /// `link_count` is 2 plus the number of immediate child directories.
    Directory { link_count: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub path: String,
    /// Permission and type bits.
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    #[serde(flatten)]
    pub kind: RecordKind,
    /// Set by the store on every read; `None` for a record never written.
    #[serde(skip)]
    pub revision: Option<Revision>,
    #[serde(skip)]
    tombstoned: bool,
}

impl Record {
    fn with_kind(path: String, mode: u32, kind: RecordKind, now: DateTime<Utc>) -> Self {
        Self {
            path,
            mode,
            uid: 0,
            gid: 0,
            created_at: now,
            accessed_at: now,
            modified_at: now,
            xattrs: BTreeMap::new(),
            kind,
            revision: None,
            tombstoned: false,
        }
    }

    /// A zero-byte file. `mode` carries permission bits only.
    pub fn new_file(path: impl Into<String>, mode: u32, now: DateTime<Utc>) -> Self {
        Self::with_kind(
            path.into(),
            S_IFREG | (mode & !S_IFMT),
            RecordKind::File {
                size: 0,
                content_hash: String::new(),
            },
            now,
        )
    }

    /// An empty directory (`.` and `..`).
    pub fn new_directory(path: impl Into<String>, mode: u32, now: DateTime<Utc>) -> Self {
        Self::with_kind(
            path.into(),
            S_IFDIR | (mode & !S_IFMT),
            RecordKind::Directory { link_count: 2 },
            now,
        )
    }

    pub fn new_root(now: DateTime<Utc>) -> Self {
        Self::new_directory(crate::paths::ROOT, 0o755, now)
    }

    pub fn entry_kind(&self) -> EntryKind {
        match self.kind {
            RecordKind::File { .. } => EntryKind::File,
            RecordKind::Directory { .. } => EntryKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, RecordKind::Directory { .. })
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            RecordKind::File { size, .. } => size,
            RecordKind::Directory { .. } => 0,
        }
    }

    pub fn content_hash(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::File { content_hash, .. } => Some(content_hash),
            RecordKind::Directory { .. } => None,
        }
    }

    pub fn link_count(&self) -> Option<u32> {
        match self.kind {
            RecordKind::Directory { link_count } => Some(link_count),
            RecordKind::File { .. } => None,
        }
    }

    /// Replace permission bits, keeping the type bits.
    pub fn set_permissions(&mut self, mode: u32) {
        self.mode = (self.mode & S_IFMT) | (mode & !S_IFMT);
    }

    /// Update size and hash from the local byte copy.
    pub fn set_content(&mut self, new_size: u64, new_hash: String) -> FsResult<()> {
        match &mut self.kind {
            RecordKind::File { size, content_hash } => {
                *size = new_size;
                *content_hash = new_hash;
                Ok(())
            }
            RecordKind::Directory { .. } => Err(FsError::IsADirectory),
        }
    }

    /// Copy of this record keyed under `new_path`, not yet written anywhere.
    pub fn relocated(&self, new_path: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.path = new_path.into();
        copy.revision = None;
        copy
    }

    pub(crate) fn tombstone(mut self) -> Self {
        self.tombstoned = true;
        self
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned
    }

    /// Stat fields as reported by `getattr`.
    pub fn to_attributes(&self) -> FsResult<Attributes> {
        if self.tombstoned {
            return Err(FsError::NotFound);
        }

        let (nlink, size) = match self.kind {
            RecordKind::File { size, .. } => (1, size),
            RecordKind::Directory { link_count } => (link_count, 0),
        };

        Ok(Attributes {
            kind: self.entry_kind(),
            mode: self.mode,
            nlink,
            size,
            uid: self.uid,
            gid: self.gid,
            atime: self.accessed_at.into(),
            mtime: self.modified_at.into(),
            ctime: self.created_at.into(),
            crtime: self.created_at.into(),
        })
    }
}

/// POSIX stat fields derived from a [`Record`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub kind: EntryKind,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl Attributes {
    pub fn permissions(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

/// Directory entry returned by `readdir`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Filesystem geometry reported by `statfs`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub name_max: u32,
}
