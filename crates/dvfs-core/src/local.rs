//! Local byte storage: the folder whose structure is mirrored into the store

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::record::EntryKind;

/// What the live filesystem says about a path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentStat {
    pub kind: EntryKind,
    pub size: u64,
    /// MD5 hex digest of the bytes; empty for a zero-byte file or a directory.
    pub content_hash: String,
    pub modified: DateTime<Utc>,
}

/// Byte storage addressed by normalized store paths
pub trait ByteStorage: Send + Sync {
    fn read_at(&self, path: &str, offset: u64, len: usize) -> FsResult<Vec<u8>>;
    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn truncate(&self, path: &str, len: u64) -> FsResult<()>;
    /// Create an empty file; `AlreadyExists` if anything is already there.
    fn create_file(&self, path: &str) -> FsResult<()>;
    fn create_dir(&self, path: &str) -> FsResult<()>;
    fn remove(&self, path: &str) -> FsResult<()>;
    fn remove_dir(&self, path: &str) -> FsResult<()>;
    fn rename(&self, old: &str, new: &str) -> FsResult<()>;
    /// `None` when nothing exists at `path`.
    fn stat(&self, path: &str) -> FsResult<Option<ContentStat>>;
    fn list_dir(&self, path: &str) -> FsResult<Vec<(String, EntryKind)>>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    format!("{:x}", md5::compute(bytes))
}

/// Byte storage rooted at a directory on the local disk
#[derive(Clone, Debug)]
pub struct LocalDiskStorage {
    root: PathBuf,
}

impl LocalDiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

impl ByteStorage for LocalDiskStorage {
    fn read_at(&self, path: &str, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let mut file = fs::File::open(self.resolve(path))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.resolve(path))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
        let file = OpenOptions::new().write(true).open(self.resolve(path))?;
        file.set_len(len)?;
        Ok(())
    }

    fn create_file(&self, path: &str) -> FsResult<()> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(path))
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(FsError::AlreadyExists),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn create_dir(&self, path: &str) -> FsResult<()> {
        match fs::create_dir(self.resolve(path)) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            other => Ok(other?),
        }
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        Ok(fs::remove_file(self.resolve(path))?)
    }

    fn remove_dir(&self, path: &str) -> FsResult<()> {
        Ok(fs::remove_dir(self.resolve(path))?)
    }

    fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        Ok(fs::rename(self.resolve(old), self.resolve(new))?)
    }

    fn stat(&self, path: &str) -> FsResult<Option<ContentStat>> {
        let full = self.resolve(path);
        let metadata = match fs::symlink_metadata(&full) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsError::Io(e)),
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        if metadata.is_dir() {
            return Ok(Some(ContentStat {
                kind: EntryKind::Directory,
                size: 0,
                content_hash: String::new(),
                modified,
            }));
        }
        if !metadata.is_file() {
            return Err(FsError::Unsupported);
        }

        let bytes = match fs::read(&full) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsError::Io(e)),
        };
        Ok(Some(ContentStat {
            kind: EntryKind::File,
            size: bytes.len() as u64,
            content_hash: content_hash(&bytes),
            modified,
        }))
    }

    fn list_dir(&self, path: &str) -> FsResult<Vec<(String, EntryKind)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!("Skipping non UTF-8 name under {}: {:?}", path, entry.file_name());
                continue;
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                entries.push((name, EntryKind::Directory));
            } else if file_type.is_file() {
                entries.push((name, EntryKind::File));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
