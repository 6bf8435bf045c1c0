//! Database migration management.

use rusqlite::{params, Connection};
use tracing::info;

/// Database migration manager.
pub struct MigrationManager;

impl MigrationManager {
    /// Apply all pending migrations to the database.
    pub fn migrate(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        let current_version = Self::current_version(conn)?.unwrap_or(0);
        if current_version > crate::SCHEMA_VERSION {
            return Err(crate::Error::migration(format!(
                "database schema version {} is newer than supported version {}",
                current_version,
                crate::SCHEMA_VERSION
            )));
        }

        if current_version < 1 {
            Self::apply_migration_1(conn)?;
            info!("Applied metadata schema migration 1");
        }

        Ok(())
    }

    /// Migration 1: path-keyed record documents and the revision sequence.
    fn apply_migration_1(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            -- One row per filesystem entry; doc holds the serialized record
            CREATE TABLE IF NOT EXISTS records (
                path TEXT PRIMARY KEY,
                parent_path TEXT,
                revision INTEGER NOT NULL,
                doc TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent_path);

            -- Single-row counter shared by every record write
            CREATE TABLE IF NOT EXISTS revision_seq (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO revision_seq (id, value) VALUES (1, 0);

            INSERT OR REPLACE INTO schema_migrations (version) VALUES (1);
            "#,
        )?;
        Ok(())
    }

    /// Highest applied migration, if any.
    pub fn current_version(conn: &Connection) -> crate::Result<Option<u32>> {
        let mut stmt = conn.prepare("SELECT MAX(version) FROM schema_migrations")?;
        let version: Option<u32> = stmt.query_row(params![], |row| row.get(0))?;
        Ok(version)
    }
}
