//! Record documents and the [`MetadataStore`] implementation over them.

use dvfs_core::{paths, FsError, FsResult, MetadataStore, Record, Revision};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::trace;

use crate::Database;

/// Row-level access to the `records` table on one connection.
pub struct RecordTable<'a> {
    conn: &'a Connection,
}

impl<'a> RecordTable<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, path: &str) -> crate::Result<Option<Record>> {
        let row = self
            .conn
            .query_row(
                "SELECT revision, doc FROM records WHERE path = ?",
                params![path],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        row.map(|(revision, doc)| Self::decode(revision, &doc))
            .transpose()
    }

    pub fn revision(&self, path: &str) -> crate::Result<Option<Revision>> {
        let revision = self
            .conn
            .query_row(
                "SELECT revision FROM records WHERE path = ?",
                params![path],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(revision.map(|r| Revision::new(r as u64)))
    }

    /// Direct children of `parent`, ordered by path.
    pub fn children(&self, parent: &str) -> crate::Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT revision, doc FROM records
            WHERE parent_path = ?
            ORDER BY path
            "#,
        )?;
        let rows = stmt.query_map(params![parent], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (revision, doc) = row?;
            records.push(Self::decode(revision, &doc)?);
        }
        Ok(records)
    }

    /// Advance the shared revision counter and return the new value.
    pub fn next_revision(&self) -> crate::Result<Revision> {
        self.conn
            .execute("UPDATE revision_seq SET value = value + 1 WHERE id = 1", [])?;
        let value: i64 =
            self.conn
                .query_row("SELECT value FROM revision_seq WHERE id = 1", [], |row| {
                    row.get(0)
                })?;
        Ok(Revision::new(value as u64))
    }

    pub fn upsert(&self, record: &Record, revision: Revision) -> crate::Result<()> {
        let doc = serde_json::to_string(record)?;
        self.conn.execute(
            r#"
            INSERT INTO records (path, parent_path, revision, doc)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                parent_path = excluded.parent_path,
                revision = excluded.revision,
                doc = excluded.doc
            "#,
            params![
                record.path,
                paths::parent(&record.path),
                revision.get() as i64,
                doc
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, path: &str) -> crate::Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM records WHERE path = ?", params![path])?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> crate::Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn decode(revision: i64, doc: &str) -> crate::Result<Record> {
        let mut record: Record = serde_json::from_str(doc)?;
        record.revision = Some(Revision::new(revision as u64));
        Ok(record)
    }
}

impl MetadataStore for Database {
    fn get(&self, path: &str) -> FsResult<Option<Record>> {
        Ok(self.read(|conn| RecordTable::new(conn).get(path))?)
    }

    fn list_children(&self, parent: &str) -> FsResult<Vec<Record>> {
        Ok(self.read(|conn| RecordTable::new(conn).children(parent))?)
    }

    fn put(&self, record: &Record, expected: Option<Revision>) -> FsResult<Revision> {
        self.transaction(|conn| {
            let table = RecordTable::new(conn);
            let current = table.revision(&record.path)?;
            if current != expected {
                trace!(
                    "put {} expected {:?}, found {:?}",
                    record.path,
                    expected,
                    current
                );
                return Err(FsError::Conflict);
            }
            let revision = table.next_revision()?;
            table.upsert(record, revision)?;
            Ok(revision)
        })
    }

    fn delete(&self, path: &str, expected: Revision) -> FsResult<()> {
        self.transaction(|conn| {
            let table = RecordTable::new(conn);
            match table.revision(path)? {
                None => Err(FsError::NotFound),
                Some(current) if current != expected => Err(FsError::Conflict),
                Some(_) => {
                    table.remove(path)?;
                    Ok(())
                }
            }
        })
    }

    fn count(&self) -> FsResult<u64> {
        Ok(self.read(|conn| RecordTable::new(conn).count())?)
    }
}
