//! ALFA Photos Sync - Local File Index
//!
//! Maps file name to record. One table holds both partitions so a name can
//! never be in Gallery and Trash at once, and a move is a single UPDATE.

use std::collections::HashSet;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{VaultError, VaultResult};
use crate::model::{AppInfo, FileRecord, IndexPath, RecordKind};

/// Persistence collaborator for the reconciler
pub trait Store: Send + Sync {
    /// Look a name up in either partition
    fn find(&self, name: &str) -> VaultResult<Option<(RecordKind, FileRecord)>>;

    /// Insert new records; fails if any name already exists
    fn add(&self, kind: RecordKind, records: &[FileRecord]) -> VaultResult<()>;

    /// Replace the stored copy of a record in `kind`
    fn update_file(&self, kind: RecordKind, record: &FileRecord) -> VaultResult<()>;

    /// Remove a record, returning what was removed
    fn delete(&self, name: &str) -> VaultResult<Option<(RecordKind, FileRecord)>>;

    /// Move every name from `from` to `to` in one transaction, stamping
    /// `date_modified`. Any name missing from `from` rolls the batch back.
    fn move_files(
        &self,
        names: &[String],
        from: RecordKind,
        to: RecordKind,
        date_modified: &str,
    ) -> VaultResult<Vec<FileRecord>>;

    fn mark_remote(&self, name: &str) -> VaultResult<()>;

    /// Position of `name` within `kind`, newest first
    fn index_path(&self, kind: RecordKind, name: &str) -> VaultResult<Option<IndexPath>>;

    /// All records of `kind`, newest first
    fn list(&self, kind: RecordKind) -> VaultResult<Vec<FileRecord>>;

    /// Every stored name across both partitions
    fn names(&self) -> VaultResult<HashSet<String>>;

    fn app_info(&self) -> VaultResult<AppInfo>;

    fn update_app_info(&self, info: &AppInfo) -> VaultResult<()>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS files (
        name TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        modified_ms INTEGER NOT NULL,
        data TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS app_info (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        data TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_files_order ON files(kind, modified_ms DESC, name);
"#;

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the index database at `path`
    pub fn open(path: &Path) -> VaultResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(VaultError::Cache)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> VaultResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> VaultResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Row counts per partition
    pub fn count(&self, kind: RecordKind) -> VaultResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn decode_row(kind: &str, data: &str) -> VaultResult<(RecordKind, FileRecord)> {
    let kind = RecordKind::parse(kind)
        .ok_or_else(|| VaultError::Store(format!("unknown partition '{kind}'")))?;
    Ok((kind, serde_json::from_str(data)?))
}

fn find_in(conn: &Connection, name: &str) -> VaultResult<Option<(RecordKind, FileRecord)>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT kind, data FROM files WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(kind, data)| decode_row(&kind, &data)).transpose()
}

impl Store for SqliteStore {
    fn find(&self, name: &str) -> VaultResult<Option<(RecordKind, FileRecord)>> {
        find_in(&self.conn.lock(), name)
    }

    fn add(&self, kind: RecordKind, records: &[FileRecord]) -> VaultResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO files (name, kind, modified_ms, data) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.name,
                    kind.as_str(),
                    record.date_modified_millis() as i64,
                    serde_json::to_string(record)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_file(&self, kind: RecordKind, record: &FileRecord) -> VaultResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE files SET modified_ms = ?1, data = ?2 WHERE name = ?3 AND kind = ?4",
            params![
                record.date_modified_millis() as i64,
                serde_json::to_string(record)?,
                record.name,
                kind.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(VaultError::NotFound(record.name.clone()));
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> VaultResult<Option<(RecordKind, FileRecord)>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing = find_in(&tx, name)?;
        if existing.is_some() {
            tx.execute("DELETE FROM files WHERE name = ?1", params![name])?;
        }
        tx.commit()?;
        Ok(existing)
    }

    fn move_files(
        &self,
        names: &[String],
        from: RecordKind,
        to: RecordKind,
        date_modified: &str,
    ) -> VaultResult<Vec<FileRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut moved = Vec::with_capacity(names.len());

        for name in names {
            let mut record = match find_in(&tx, name)? {
                Some((kind, record)) if kind == from => record,
                // Dropping `tx` rolls back
                _ => return Err(VaultError::NotFound(name.clone())),
            };
            record.date_modified = date_modified.to_string();

            tx.execute(
                "UPDATE files SET kind = ?1, modified_ms = ?2, data = ?3 WHERE name = ?4",
                params![
                    to.as_str(),
                    record.date_modified_millis() as i64,
                    serde_json::to_string(&record)?,
                    name
                ],
            )?;
            moved.push(record);
        }

        tx.commit()?;
        Ok(moved)
    }

    fn mark_remote(&self, name: &str) -> VaultResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let (_, mut record) = find_in(&tx, name)?.ok_or_else(|| VaultError::NotFound(name.into()))?;
        record.is_remote = true;
        tx.execute(
            "UPDATE files SET data = ?1 WHERE name = ?2",
            params![serde_json::to_string(&record)?, name],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn index_path(&self, kind: RecordKind, name: &str) -> VaultResult<Option<IndexPath>> {
        let conn = self.conn.lock();
        let modified: Option<i64> = conn
            .query_row(
                "SELECT modified_ms FROM files WHERE name = ?1 AND kind = ?2",
                params![name, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(modified) = modified else {
            return Ok(None);
        };

        let row: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE kind = ?1
             AND (modified_ms > ?2 OR (modified_ms = ?2 AND name < ?3))",
            params![kind.as_str(), modified, name],
            |row| row.get(0),
        )?;

        Ok(Some(IndexPath {
            section: 0,
            row: row as usize,
        }))
    }

    fn list(&self, kind: RecordKind) -> VaultResult<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM files WHERE kind = ?1 ORDER BY modified_ms DESC, name",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    fn names(&self) -> VaultResult<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM files")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let names = rows.collect::<Result<HashSet<_>, _>>()?;
        Ok(names)
    }

    fn app_info(&self) -> VaultResult<AppInfo> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row("SELECT data FROM app_info WHERE id = 0", [], |row| row.get(0))
            .optional()?;
        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(AppInfo::default()),
        }
    }

    fn update_app_info(&self, info: &AppInfo) -> VaultResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO app_info (id, data) VALUES (0, ?1)",
            params![serde_json::to_string(info)?],
        )?;
        Ok(())
    }
}
