//! SQLite-backed catalog.
//!
//! Runs in WAL mode so the worker can write while readers (the control
//! surface, the watcher) keep reading. Every multi-step change runs in a
//! transaction; the claim is a single `UPDATE ... RETURNING`.

use super::{current_timestamp_ms, Catalog, CatalogError, Status, VideoRecord};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    id               TEXT PRIMARY KEY NOT NULL,
    directory        TEXT NOT NULL,
    filename         TEXT NOT NULL,
    size_original    INTEGER NOT NULL,
    size_compressed  INTEGER,
    duration_seconds REAL,
    width            INTEGER,
    height           INTEGER,
    fps              REAL,
    indexed_at       INTEGER NOT NULL,
    last_modified    INTEGER NOT NULL,
    status           TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_videos_location
    ON videos (directory, filename) WHERE status <> 'removed';
CREATE INDEX IF NOT EXISTS idx_videos_status ON videos (status);
"#;

const COLUMNS: &str = "id, directory, filename, size_original, size_compressed, duration_seconds, \
                       width, height, fps, indexed_at, last_modified, status";

/// Catalog stored in a single SQLite database file.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open (or create) the catalog at `path` and switch it to WAL mode.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened catalog");
        Self::init(conn)
    }

    /// Private in-memory catalog, used by tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CatalogError> {
        self.conn.lock().map_err(|_| CatalogError::Poisoned)
    }

    fn query_records(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<VideoRecord>, CatalogError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<VideoRecord> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let directory: String = row.get(1)?;
    let status: String = row.get(11)?;
    let status = status
        .parse::<Status>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

    Ok(VideoRecord {
        id,
        directory: PathBuf::from(directory),
        filename: row.get(2)?,
        size_original: row.get::<_, i64>(3)? as u64,
        size_compressed: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        duration_seconds: row.get(5)?,
        width: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        height: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        fps: row.get(8)?,
        indexed_at: row.get(9)?,
        last_modified: row.get(10)?,
        status,
    })
}

impl Catalog for SqliteCatalog {
    fn get(&self, id: &Uuid) -> Result<Option<VideoRecord>, CatalogError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM videos WHERE id = ?1"),
                params![id.to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn find_by_location(
        &self,
        directory: &Path,
        filename: &str,
    ) -> Result<Option<VideoRecord>, CatalogError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM videos \
                     WHERE directory = ?1 AND filename = ?2 AND status <> 'removed'"
                ),
                params![path_to_text(directory), filename],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list_by_status(&self, status: Status) -> Result<Vec<VideoRecord>, CatalogError> {
        let conn = self.lock()?;
        Self::query_records(
            &conn,
            &format!("SELECT {COLUMNS} FROM videos WHERE status = ?1 ORDER BY rowid"),
            params![status.as_str()],
        )
    }

    fn list_all(&self) -> Result<Vec<VideoRecord>, CatalogError> {
        let conn = self.lock()?;
        Self::query_records(
            &conn,
            &format!("SELECT {COLUMNS} FROM videos ORDER BY rowid"),
            [],
        )
    }

    fn insert(&self, record: &VideoRecord) -> Result<bool, CatalogError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO videos ({COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                record.id.to_string(),
                path_to_text(&record.directory),
                record.filename,
                record.size_original as i64,
                record.size_compressed.map(|v| v as i64),
                record.duration_seconds,
                record.width.map(|v| v as i64),
                record.height.map(|v| v as i64),
                record.fps,
                record.indexed_at,
                record.last_modified,
                record.status.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn update_media(&self, record: &VideoRecord) -> Result<(), CatalogError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE videos SET size_original = ?1, duration_seconds = ?2, width = ?3, \
             height = ?4, fps = ?5, last_modified = ?6, indexed_at = ?7 WHERE id = ?8",
            params![
                record.size_original as i64,
                record.duration_seconds,
                record.width.map(|v| v as i64),
                record.height.map(|v| v as i64),
                record.fps,
                record.last_modified,
                current_timestamp_ms(),
                record.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(CatalogError::NotFound(record.id));
        }
        Ok(())
    }

    fn delete(&self, id: &Uuid) -> Result<bool, CatalogError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM videos WHERE id = ?1", params![id.to_string()])?;
        Ok(changed == 1)
    }

    fn transition(&self, ids: &[Uuid], from: &[Status], to: Status) -> Result<usize, CatalogError> {
        if to == Status::Compressed {
            return Err(CatalogError::InvalidTransition(to));
        }
        if ids.is_empty() || from.is_empty() {
            return Ok(0);
        }

        let placeholders = (0..from.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE videos SET status = ?1, size_compressed = NULL \
             WHERE id = ?2 AND status IN ({placeholders})"
        );

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(&sql)?;
            for id in ids {
                let mut values = vec![to.as_str().to_string(), id.to_string()];
                values.extend(from.iter().map(|s| s.as_str().to_string()));
                changed += stmt.execute(params_from_iter(values.iter()))?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn reset_status(&self, from: Status, to: Status) -> Result<usize, CatalogError> {
        if to == Status::Compressed {
            return Err(CatalogError::InvalidTransition(to));
        }
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE videos SET status = ?1, size_compressed = NULL WHERE status = ?2",
            params![to.as_str(), from.as_str()],
        )?;
        Ok(changed)
    }

    fn claim_next(&self) -> Result<Option<VideoRecord>, CatalogError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "UPDATE videos SET status = 'processing' \
                     WHERE rowid = (SELECT rowid FROM videos WHERE status = 'to_process' \
                                    ORDER BY rowid LIMIT 1) \
                     RETURNING {COLUMNS}"
                ),
                [],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn mark_compressed(
        &self,
        id: &Uuid,
        filename: &str,
        size_compressed: u64,
    ) -> Result<(), CatalogError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let directory: Option<String> = tx
            .query_row(
                "SELECT directory FROM videos WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let directory = directory.ok_or(CatalogError::NotFound(*id))?;

        tx.execute(
            "DELETE FROM videos WHERE directory = ?1 AND filename = ?2 AND id <> ?3",
            params![directory, filename, id.to_string()],
        )?;
        tx.execute(
            "UPDATE videos SET filename = ?1, size_compressed = ?2, status = 'compressed', \
             indexed_at = ?3 WHERE id = ?4",
            params![
                filename,
                size_compressed as i64,
                current_timestamp_ms(),
                id.to_string()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), CatalogError> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}
