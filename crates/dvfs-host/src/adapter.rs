//! dvfs FUSE adapter
//!
//! Maps FUSE operations onto the dispatcher. Inode numbers are assigned to
//! store paths on first sight and follow them across renames.

#[cfg(not(feature = "fuse"))]
compile_error!("This module requires the 'fuse' feature to be enabled");

use chrono::{DateTime, Utc};
use dvfs_core::{paths, Attributes, Dispatcher, EntryKind, FsError};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{c_int, EINVAL, ENOENT, ERANGE};
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::inodes::InodeTable;

/// dvfs FUSE filesystem adapter
pub struct DvfsFuse {
    dispatcher: Dispatcher,
    inodes: InodeTable,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
    }
}

fn errno(e: FsError) -> c_int {
    if let FsError::StoreUnavailable(_) | FsError::Integrity(_) = e {
        warn!("Filesystem call failed: {}", e);
    } else {
        debug!("Filesystem call failed: {}", e);
    }
    e.errno()
}

fn to_datetime(time: TimeOrNow) -> DateTime<Utc> {
    match time {
        TimeOrNow::SpecificTime(t) => DateTime::<Utc>::from(t),
        TimeOrNow::Now => Utc::now(),
    }
}

impl DvfsFuse {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let cache = &dispatcher.config().cache;
        let attr_ttl = Duration::from_millis(cache.attr_ttl_ms as u64);
        let entry_ttl = Duration::from_millis(cache.entry_ttl_ms as u64);
        Self {
            dispatcher,
            inodes: InodeTable::new(),
            attr_ttl,
            entry_ttl,
        }
    }

    fn path(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path(ino).map(str::to_string).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        self.inodes.child_path(parent, name).ok_or(ENOENT)
    }

    fn attr_to_fuse(&self, attr: &Attributes, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            kind: file_type(attr.kind),
            perm: attr.permissions(),
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// Attributes for `path`, registering its inode.
    fn entry(&mut self, path: &str) -> Result<FileAttr, c_int> {
        let attr = self.dispatcher.getattr(path).map_err(errno)?;
        let ino = self.inodes.ino(path);
        Ok(self.attr_to_fuse(&attr, ino))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileAttr, c_int> {
        let path = self.path(ino)?;
        if let Some(mode) = mode {
            self.dispatcher.chmod(&path, mode).map_err(errno)?;
        }
        if uid.is_some() || gid.is_some() {
            self.dispatcher.chown(&path, uid, gid).map_err(errno)?;
        }
        if let Some(size) = size {
            self.dispatcher.truncate(&path, size).map_err(errno)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.dispatcher
                .utimens(&path, atime.map(to_datetime), mtime.map(to_datetime))
                .map_err(errno)?;
        }
        self.entry(&path)
    }
}

impl Filesystem for DvfsFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.child(parent, name).and_then(|path| self.entry(&path)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.path(ino).and_then(|path| self.entry(&path)) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.apply_setattr(ino, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child(parent, name).and_then(|path| {
            self.dispatcher.mkdir(&path, mode & !umask).map_err(errno)?;
            self.entry(&path)
        });
        match result {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child(parent, name).and_then(|path| {
            self.dispatcher.create(&path, mode & !umask).map_err(errno)?;
            let fh = self.dispatcher.open(&path).map_err(errno)?;
            Ok((self.entry(&path)?, fh))
        });
        match result {
            Ok((attr, fh)) => reply.created(&self.entry_ttl, &attr, 0, fh, flags as u32),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self
            .path(ino)
            .and_then(|path| self.dispatcher.open(&path).map_err(errno))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.path(ino).and_then(|path| {
            self.dispatcher
                .read(&path, size as usize, offset as u64)
                .map_err(errno)
        }) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.path(ino).and_then(|path| {
            self.dispatcher
                .write(&path, data, offset as u64)
                .map_err(errno)
        }) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.child(parent, name).and_then(|old| {
            let new = self.child(newparent, newname)?;
            self.dispatcher.rename(&old, &new).map_err(errno)?;
            self.inodes.rename(&old, &new);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|path| {
            self.dispatcher.unlink(&path).map_err(errno)?;
            self.inodes.forget(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|path| {
            self.dispatcher.rmdir(&path).map_err(errno)?;
            self.inodes.forget(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let entries = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };

        let parent_ino = paths::parent(&path).map_or(ino, |p| self.inodes.ino(p));
        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let entry_ino = match entry.name.as_str() {
                "." => ino,
                ".." => parent_ino,
                name => self.inodes.ino(&paths::join(&path, name)),
            };
            // A full buffer ends this batch; the kernel asks again from here.
            if reply.add(entry_ino, (i + 1) as i64, file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.dispatcher.statfs() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.blocks_free,
                stats.blocks_available,
                stats.files,
                0,
                stats.block_size,
                stats.name_max,
                stats.block_size,
            ),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.path(ino).and_then(|path| {
            let name = name.to_str().ok_or(EINVAL)?;
            self.dispatcher.setxattr(&path, name, value).map_err(errno)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let result = self.path(ino).and_then(|path| {
            let name = name.to_str().ok_or(EINVAL)?;
            self.dispatcher.getxattr(&path, name).map_err(errno)
        });
        match result {
            Ok(value) => reply_xattr(reply, size, &value),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .path(ino)
            .and_then(|path| self.dispatcher.listxattr(&path).map_err(errno));
        match result {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                reply_xattr(reply, size, &buf);
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.path(ino).and_then(|path| {
            let name = name.to_str().ok_or(EINVAL)?;
            self.dispatcher.removexattr(&path, name).map_err(errno)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }
}

/// Size probe when `size` is zero, otherwise the data if it fits.
fn reply_xattr(reply: ReplyXattr, size: u32, data: &[u8]) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if data.len() > size as usize {
        reply.error(ERANGE);
    } else {
        reply.data(data);
    }
}
