//! Error types for the dvfs metadata layer

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("revision conflict")]
    Conflict,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("no such attribute")]
    NoAttribute,
    #[error("unsupported")]
    Unsupported,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// The tree invariants were already broken when the operation ran.
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::StoreUnavailable(message.into())
    }

    pub fn integrity<S: Into<String>>(message: S) -> Self {
        Self::Integrity(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FsError::Conflict)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound => true,
            FsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// POSIX error code reported at the filesystem-call boundary.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Conflict => libc::EAGAIN,
            FsError::PermissionDenied => libc::EACCES,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NoAttribute => libc::ENODATA,
            FsError::Unsupported => libc::ENOTSUP,
            FsError::StoreUnavailable(_) | FsError::Integrity(_) => libc::EIO,
            FsError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => libc::ENOENT,
                io::ErrorKind::AlreadyExists => libc::EEXIST,
                io::ErrorKind::PermissionDenied => libc::EACCES,
                _ => e.raw_os_error().unwrap_or(libc::EIO),
            },
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;
