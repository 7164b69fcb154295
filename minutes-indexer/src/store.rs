//! SQLite page store with FTS5 full-text search.
//!
//! One row per `(body, date, page)`. The FTS index is an external-content
//! table kept in sync by triggers, so every write path goes through plain
//! `INSERT`/`UPDATE`/`DELETE` on `pages`.
//!
//! A SQLite connection is not shareable across threads, so the store owns a
//! single connection behind a mutex. That mutex is the write gate: workers
//! call [`PageStore::upsert`] concurrently and never lock anything themselves.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// File name of the database inside the configured database directory.
pub const DATABASE_FILE: &str = "minutes.db";

/// How long a write waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// A full-text search hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHit {
    pub body: String,
    pub date: String,
    pub page: usize,
    pub snippet: String,
}

/// Persistent store of OCR'd page text
pub struct PageStore {
    conn: Mutex<Connection>,
}

impl PageStore {
    /// Open or create the database at the given path.
    ///
    /// The schema is not touched; call [`PageStore::ensure_schema`] before
    /// the first write.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
            })?;
        }

        let conn = Connection::open(path).map_err(StoreError::Connection)?;

        // WAL lets searches run while an ingestion pass is writing
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(StoreError::Query)?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(StoreError::Query)?;

        debug!(path = %path.display(), "Opened page store");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Create the pages table, its FTS index, and sync triggers if absent.
    ///
    /// Runs in one transaction, so an interrupted process leaves either the
    /// complete schema or none of it.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| StoreError::Schema {
            message: format!("Failed to begin schema transaction: {}", e),
        })?;

        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pages (
                body TEXT NOT NULL,
                date TEXT NOT NULL,
                page INTEGER NOT NULL,
                text TEXT NOT NULL,
                indexed_at TEXT NOT NULL,
                PRIMARY KEY (body, date, page)
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS pages_fts USING fts5(
                text,
                content='pages',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS pages_ai AFTER INSERT ON pages BEGIN
                INSERT INTO pages_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE TRIGGER IF NOT EXISTS pages_ad AFTER DELETE ON pages BEGIN
                INSERT INTO pages_fts(pages_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
            END;

            CREATE TRIGGER IF NOT EXISTS pages_au AFTER UPDATE ON pages BEGIN
                INSERT INTO pages_fts(pages_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
                INSERT INTO pages_fts(rowid, text) VALUES (new.rowid, new.text);
            END;
            "#,
        )
        .map_err(|e| StoreError::Schema {
            message: e.to_string(),
        })?;

        tx.commit().map_err(|e| StoreError::Schema {
            message: format!("Failed to commit schema: {}", e),
        })?;

        info!("Page store schema ready");

        Ok(())
    }

    /// Insert or replace the text of one page.
    ///
    /// `ON CONFLICT DO UPDATE` rather than `INSERT OR REPLACE`: the replace
    /// path deletes without firing the delete trigger, which would leave
    /// stale rows in the FTS index.
    pub fn upsert(&self, body: &str, date: &str, page: usize, text: &str) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO pages (body, date, page, text, indexed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (body, date, page) DO UPDATE SET
                text = excluded.text,
                indexed_at = excluded.indexed_at
            "#,
            params![body, date, page as i64, text, Utc::now().to_rfc3339()],
        )
        .map_err(StoreError::Query)?;

        Ok(())
    }

    /// Remove pages of a document at or beyond `page_count`.
    ///
    /// Returns the number of rows removed.
    pub fn prune_pages(&self, body: &str, date: &str, page_count: usize) -> StoreResult<usize> {
        let conn = self.conn()?;

        let removed = conn
            .execute(
                "DELETE FROM pages WHERE body = ?1 AND date = ?2 AND page >= ?3",
                params![body, date, page_count as i64],
            )
            .map_err(StoreError::Query)?;

        Ok(removed)
    }

    /// Total number of page records
    pub fn page_count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM pages", [], |row| row.get(0))
            .map_err(StoreError::Query)?;

        Ok(count as usize)
    }

    /// Search page text using full-text search (FTS5)
    pub fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<PageHit>> {
        // Quote every term so user input cannot inject FTS syntax
        let fts_query = query
            .split_whitespace()
            .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" ");

        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT p.body, p.date, p.page,
                       snippet(pages_fts, 0, '[', ']', '...', 12)
                FROM pages_fts
                JOIN pages p ON p.rowid = pages_fts.rowid
                WHERE pages_fts MATCH ?1
                ORDER BY bm25(pages_fts)
                LIMIT ?2
                "#,
            )
            .map_err(StoreError::Query)?;

        let hits = stmt
            .query_map(params![fts_query, limit as i64], |row| {
                Ok(PageHit {
                    body: row.get(0)?,
                    date: row.get(1)?,
                    page: row.get::<_, i64>(2)? as usize,
                    snippet: row.get(3)?,
                })
            })
            .map_err(StoreError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Query)?;

        Ok(hits)
    }
}
