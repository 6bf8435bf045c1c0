//! Database connection management.

use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to one SQLite connection.
#[derive(Debug, Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
}

impl Database {
    /// Get the default database path.
    ///
    /// Priority order:
    /// 1. `DVFS_HOME` environment variable
    /// 2. `${XDG_STATE_HOME:-~/.local/state}/dvfs/state.db`
    pub fn default_path() -> crate::Result<PathBuf> {
        if let Ok(home) = std::env::var("DVFS_HOME") {
            return Ok(PathBuf::from(home).join("state.db"));
        }

        let state_home = match std::env::var("XDG_STATE_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME")
                    .map_err(|_| crate::Error::generic("HOME environment variable not set"))?;
                PathBuf::from(home).join(".local").join("state")
            }
        };
        Ok(state_home.join("dvfs").join("state.db"))
    }

    /// Open the database at the default path.
    pub fn open_default() -> crate::Result<Self> {
        let path = Self::default_path()?;
        Self::open(&path)
    }

    /// Open (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        debug!("Opening metadata database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::initialize(conn)
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> crate::Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> crate::Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        crate::migrations::MigrationManager::migrate(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside an immediate transaction, committing on success.
    ///
    /// The write lock is taken up front, so reads made inside `f` stay valid
    /// until commit even with other processes writing to the same file.
    pub fn transaction<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
        E: From<crate::Error>,
    {
        let mut conn = self.connection.lock().map_err(|e| {
            crate::Error::generic(format!("Failed to acquire database lock: {}", e))
        })?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(crate::Error::from)?;
        match f(&tx) {
            Ok(result) => {
                tx.commit().map_err(crate::Error::from)?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback().map_err(crate::Error::from)?;
                Err(e)
            }
        }
    }

    /// Run a read-only query against the connection.
    pub fn read<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let conn = self.connection.lock().map_err(|e| {
            crate::Error::generic(format!("Failed to acquire database lock: {}", e))
        })?;
        f(&conn)
    }
}
