//! SQLite metadata store for dvfs.
//!
//! Records are kept as JSON documents keyed by path, with the parent path and
//! revision in their own columns. Every check-and-set runs in an immediate
//! transaction, so several processes may share one database file.

pub mod connection;
pub mod migrations;
pub mod records;
pub mod schema;

use dvfs_core::FsError;

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic database error: {0}")]
    Generic(String),
}

impl Error {
    pub fn migration<S: Into<String>>(message: S) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }
}

impl From<Error> for FsError {
    fn from(err: Error) -> Self {
        match err {
            // A document the store cannot parse is corruption, not an outage.
            Error::Serde(e) => FsError::integrity(format!("bad record document: {}", e)),
            Error::Io(e) => FsError::Io(e),
            other => FsError::store(other.to_string()),
        }
    }
}

pub use connection::Database;
pub use records::RecordTable;
pub use schema::SCHEMA_VERSION;
