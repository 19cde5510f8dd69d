use chrono::{DateTime, Duration, SecondsFormat, Utc};
use millrace_core::model::{
    ChunkRecord, FeedStatus, FileRecord, FileStatus, FileType, GlobalContentEntry, IngestSource,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::taxonomy::parse_uuid;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Catalog task join failure")]
    TaskJoin,
    #[error("Not found")]
    NotFound,
}

impl millrace_core::error::MillraceError for CatalogError {
    fn error_code(&self) -> millrace_core::error::ErrorCode {
        use millrace_core::error::ErrorCode;
        match self {
            CatalogError::NotFound => ErrorCode::NotFound,
            CatalogError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ErrorCode::Conflict
            }
            _ => ErrorCode::Internal,
        }
    }
}

pub const ERROR_MESSAGE_MAX: usize = 255;

/// Authoritative relational store: files, chunks, global content index,
/// taxonomy, entity links, feed metrics. All access funnels through a single
/// connection moved onto the blocking pool, so writers serialize naturally
/// and the async runtime never touches SQLite directly.
#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, CatalogError> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).ok();
                }
            }
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "busy_timeout", 5_000)?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|_| CatalogError::TaskJoin)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CatalogError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            f(&mut guard)
        })
        .await
        .map_err(|_| CatalogError::TaskJoin)?
    }

    // ---- businesses ----

    pub async fn ensure_business(&self, name: String) -> Result<Uuid, CatalogError> {
        self.with_conn(move |conn| ensure_business(conn, &name)).await
    }

    // ---- files ----

    pub async fn insert_file(&self, record: FileRecord) -> Result<(), CatalogError> {
        self.with_conn(move |conn| insert_file(conn, &record)).await
    }

    pub async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>, CatalogError> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_FILE),
                    params![id.to_string()],
                    file_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Claim an uploaded file for processing. Returns false when some other
    /// worker already moved it out of `uploaded`.
    pub async fn acquire_file(&self, id: Uuid) -> Result<bool, CatalogError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE files SET status = 'processing', updated_at = ?2
                 WHERE id = ?1 AND status = 'uploaded'",
                params![id.to_string(), now_str()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Tier-1 media dedup probe: the earliest processed file sharing this
    /// byte hash, excluding the record being ingested.
    pub async fn find_processed_with_hash(
        &self,
        file_hash: String,
        exclude: Uuid,
    ) -> Result<Option<FileRecord>, CatalogError> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!(
                        "{} WHERE file_hash = ?1 AND status = 'processed' AND id != ?2
                         ORDER BY created_at ASC LIMIT 1",
                        SELECT_FILE
                    ),
                    params![file_hash, exclude.to_string()],
                    file_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    pub async fn set_file_hash(&self, id: Uuid, hash: String) -> Result<(), CatalogError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE files
                 SET file_hash = ?2,
                     metadata = json_set(metadata, '$.file_hash', ?2),
                     updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), hash, now_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_failed(&self, id: Uuid, message: String) -> Result<(), CatalogError> {
        let message: String = message.chars().take(ERROR_MESSAGE_MAX).collect();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE files SET status = 'failed', error_message = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), message, now_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_duplicate(&self, id: Uuid) -> Result<(), CatalogError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE files
                 SET status = 'duplicate', total_chunks = 0, unique_chunks = 0,
                     duplicate_chunks = 0, dedup_ratio = 0.0, updated_at = ?2
                 WHERE id = ?1",
                params![id.to_string(), now_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Flip a record to `processed` with its counters. Returns false when the
    /// partial unique index on (file_hash, processed) rejects the flip, i.e.
    /// a concurrent worker already processed identical bytes.
    pub async fn try_mark_processed(
        &self,
        id: Uuid,
        total_chunks: i64,
        unique_chunks: i64,
        duplicate_chunks: i64,
        dedup_ratio: f64,
    ) -> Result<bool, CatalogError> {
        self.with_conn(move |conn| {
            mark_processed(
                conn,
                id,
                total_chunks,
                unique_chunks,
                duplicate_chunks,
                dedup_ratio,
            )
        })
        .await
    }

    /// Files stuck in `processing` longer than the grace period are pushed
    /// back to `uploaded` and returned for re-queuing.
    pub async fn requeue_stale(
        &self,
        grace: Duration,
    ) -> Result<Vec<FileRecord>, CatalogError> {
        let cutoff = ts_str(Utc::now() - grace);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE status = 'processing' AND updated_at < ?1",
                SELECT_FILE
            ))?;
            let stale: Vec<FileRecord> = stmt
                .query_map(params![cutoff], file_from_row)?
                .collect::<Result<_, _>>()?;
            drop(stmt);
            for record in &stale {
                conn.execute(
                    "UPDATE files SET status = 'uploaded', updated_at = ?2 WHERE id = ?1",
                    params![record.id.to_string(), now_str()],
                )?;
            }
            Ok(stale)
        })
        .await
    }

    // ---- chunks ----

    pub async fn chunks_for_file(&self, file_id: Uuid) -> Result<Vec<ChunkRecord>, CatalogError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE file_id = ?1 ORDER BY chunk_index ASC",
                SELECT_CHUNK
            ))?;
            let chunks = stmt
                .query_map(params![file_id.to_string()], chunk_from_row)?
                .collect::<Result<_, _>>()?;
            Ok(chunks)
        })
        .await
    }

    pub async fn count_chunks(&self, file_id: Uuid) -> Result<i64, CatalogError> {
        self.with_conn(move |conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE file_id = ?1",
                params![file_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    /// Tier-2 dedup probe: which of these hashes already have a chunk row in
    /// this file. Batched into a single IN query.
    pub async fn existing_chunk_hashes(
        &self,
        file_id: Uuid,
        hashes: Vec<String>,
    ) -> Result<HashSet<String>, CatalogError> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; hashes.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT semantic_hash FROM chunks WHERE file_id = ? AND semantic_hash IN ({})",
                placeholders
            ))?;
            let found = stmt
                .query_map(
                    params_from_iter(
                        std::iter::once(file_id.to_string()).chain(hashes.into_iter()),
                    ),
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<_, _>>()?;
            Ok(found)
        })
        .await
    }

    // ---- global content index ----

    pub async fn global_entry(
        &self,
        semantic_hash: String,
    ) -> Result<Option<GlobalContentEntry>, CatalogError> {
        self.with_conn(move |conn| {
            let entry = conn
                .query_row(
                    &format!("{} WHERE semantic_hash = ?1", SELECT_GLOBAL),
                    params![semantic_hash],
                    global_from_row,
                )
                .optional()?;
            Ok(entry)
        })
        .await
    }

    /// Full walk of the index, used by the vector reconciliation pass.
    pub async fn all_global_entries(&self) -> Result<Vec<GlobalContentEntry>, CatalogError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{} ORDER BY created_at ASC", SELECT_GLOBAL))?;
            let entries = stmt
                .query_map([], global_from_row)?
                .collect::<Result<_, _>>()?;
            Ok(entries)
        })
        .await
    }

    pub async fn counts(&self) -> Result<CatalogCounts, CatalogError> {
        self.with_conn(|conn| {
            let files = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
            let chunks = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
            let global_entries =
                conn.query_row("SELECT COUNT(*) FROM global_content", [], |r| r.get(0))?;
            let entity_links =
                conn.query_row("SELECT COUNT(*) FROM entity_links", [], |r| r.get(0))?;
            Ok(CatalogCounts {
                files,
                chunks,
                global_entries,
                entity_links,
            })
        })
        .await
    }

    // ---- ingest sources ----

    pub async fn ensure_source(&self, feed_url: String) -> Result<Uuid, CatalogError> {
        self.with_conn(move |conn| {
            if let Some(id) = conn
                .query_row(
                    "SELECT id FROM ingest_sources WHERE feed_url = ?1",
                    params![feed_url],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            {
                return Ok(parse_uuid(&id)?);
            }
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO ingest_sources (id, feed_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![id.to_string(), feed_url, now_str()],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn record_feed_run(
        &self,
        feed_url: String,
        seen: i64,
        ingested: i64,
        failures: i64,
        status: FeedStatus,
        avg_confidence: f64,
    ) -> Result<(), CatalogError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE ingest_sources
                 SET entries_seen = entries_seen + ?2,
                     entries_ingested = entries_ingested + ?3,
                     failures = failures + ?4,
                     status = ?5,
                     avg_confidence = ?6,
                     last_run_at = ?7,
                     updated_at = ?7
                 WHERE feed_url = ?1",
                params![
                    feed_url,
                    seen,
                    ingested,
                    failures,
                    status.as_str(),
                    avg_confidence,
                    now_str()
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_sources(&self) -> Result<Vec<IngestSource>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY feed_url ASC", SELECT_SOURCE))?;
            let sources = stmt
                .query_map([], source_from_row)?
                .collect::<Result<_, _>>()?;
            Ok(sources)
        })
        .await
    }

    pub async fn reset_sources(&self) -> Result<usize, CatalogError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE ingest_sources
                 SET entries_seen = 0, entries_ingested = 0, failures = 0,
                     status = 'idle', avg_confidence = 0.0, updated_at = ?1",
                params![now_str()],
            )?;
            Ok(n)
        })
        .await
    }

    /// Clear a failed feed so the next poll cycle picks it up again.
    pub async fn mark_source_retry(&self, feed_url: String) -> Result<bool, CatalogError> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE ingest_sources SET status = 'idle', updated_at = ?2
                 WHERE feed_url = ?1",
                params![feed_url, now_str()],
            )?;
            Ok(n == 1)
        })
        .await
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CatalogCounts {
    pub files: i64,
    pub chunks: i64,
    pub global_entries: i64,
    pub entity_links: i64,
}

// ---- synchronous helpers shared with the relational writer ----

pub(crate) fn ensure_business(conn: &Connection, name: &str) -> Result<Uuid, CatalogError> {
    if let Some(id) = conn
        .query_row(
            "SELECT id FROM businesses WHERE name = ?1",
            params![name],
            |row| row.get::<_, String>(0),
        )
        .optional()?
    {
        return parse_uuid(&id);
    }
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO businesses (id, name, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![id.to_string(), name, now_str()],
    )?;
    // A concurrent insert may have won the conflict; read back the winner.
    let id: String = conn.query_row(
        "SELECT id FROM businesses WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    parse_uuid(&id)
}

pub(crate) fn insert_file(conn: &Connection, record: &FileRecord) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR IGNORE INTO files
         (id, business_id, file_name, file_type, source, metadata, file_hash, parser_used,
          status, total_chunks, unique_chunks, duplicate_chunks, dedup_ratio, error_message,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            record.id.to_string(),
            record.business_id.to_string(),
            record.file_name,
            record.file_type.as_str(),
            record.source,
            serde_json::to_string(&record.metadata)?,
            record.file_hash(),
            record.parser_used,
            record.status.as_str(),
            record.total_chunks,
            record.unique_chunks,
            record.duplicate_chunks,
            record.dedup_ratio,
            record.error_message,
            ts_str(record.created_at),
            ts_str(record.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn mark_processed(
    conn: &Connection,
    id: Uuid,
    total_chunks: i64,
    unique_chunks: i64,
    duplicate_chunks: i64,
    dedup_ratio: f64,
) -> Result<bool, CatalogError> {
    let result = conn.execute(
        "UPDATE files
         SET status = 'processed', total_chunks = ?2, unique_chunks = ?3,
             duplicate_chunks = ?4, dedup_ratio = ?5, error_message = NULL, updated_at = ?6
         WHERE id = ?1",
        params![
            id.to_string(),
            total_chunks,
            unique_chunks,
            duplicate_chunks,
            dedup_ratio,
            now_str()
        ],
    );
    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// First insert wins; on hash conflict no row is written and the caller
/// bumps `occurrence_count` with the conditional update below.
pub(crate) fn upsert_global(
    conn: &Connection,
    entry: &GlobalContentEntry,
) -> Result<(Uuid, bool), CatalogError> {
    let inserted = conn.execute(
        "INSERT INTO global_content
         (id, semantic_hash, cleaned_text, raw_text, tokens, business_id, first_seen_file_id,
          source_type, occurrence_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)
         ON CONFLICT(semantic_hash) DO NOTHING",
        params![
            entry.id.to_string(),
            entry.semantic_hash,
            entry.cleaned_text,
            entry.raw_text,
            entry.tokens,
            entry.business_id.to_string(),
            entry.first_seen_file_id.to_string(),
            entry.source_type.as_str(),
            now_str(),
        ],
    )?;
    let id: String = conn.query_row(
        "SELECT id FROM global_content WHERE semantic_hash = ?1",
        params![entry.semantic_hash],
        |row| row.get(0),
    )?;
    Ok((parse_uuid(&id)?, inserted == 1))
}

/// Conditional increment: only touches a row that is already visible, so a
/// racing writer can under-count briefly but never over-count.
pub(crate) fn increment_occurrence(
    conn: &Connection,
    semantic_hash: &str,
) -> Result<bool, CatalogError> {
    let n = conn.execute(
        "UPDATE global_content
         SET occurrence_count = occurrence_count + 1, updated_at = ?2
         WHERE semantic_hash = ?1",
        params![semantic_hash, now_str()],
    )?;
    Ok(n == 1)
}

pub(crate) fn max_chunk_index(conn: &Connection, file_id: Uuid) -> Result<i64, CatalogError> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(chunk_index) FROM chunks WHERE file_id = ?1",
        params![file_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(-1))
}

pub(crate) fn insert_chunk(conn: &Connection, chunk: &ChunkRecord) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT INTO chunks
         (id, file_id, business_id, chunk_index, text, cleaned_text, tokens, source_type,
          metadata, confidence, semantic_hash, global_content_id, reasoning, is_duplicate,
          created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            chunk.id.to_string(),
            chunk.file_id.to_string(),
            chunk.business_id.to_string(),
            chunk.chunk_index,
            chunk.text,
            chunk.cleaned_text,
            chunk.tokens,
            chunk.source_type.as_str(),
            serde_json::to_string(&chunk.metadata)?,
            chunk.confidence,
            chunk.semantic_hash,
            chunk.global_content_id.map(|id| id.to_string()),
            serde_json::to_string(&chunk.reasoning)?,
            chunk.is_duplicate as i64,
            ts_str(chunk.created_at),
        ],
    )?;
    Ok(())
}

// ---- schema ----

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS businesses (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            id               TEXT PRIMARY KEY,
            business_id      TEXT NOT NULL REFERENCES businesses(id),
            file_name        TEXT NOT NULL,
            file_type        TEXT NOT NULL,
            source           TEXT NOT NULL,
            metadata         TEXT NOT NULL DEFAULT '{}',
            file_hash        TEXT,
            parser_used      TEXT,
            status           TEXT NOT NULL DEFAULT 'uploaded',
            total_chunks     INTEGER NOT NULL DEFAULT 0,
            unique_chunks    INTEGER NOT NULL DEFAULT 0,
            duplicate_chunks INTEGER NOT NULL DEFAULT 0,
            dedup_ratio      REAL NOT NULL DEFAULT 0.0,
            error_message    TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        -- At most one processed record per byte hash; concurrent ingests of
        -- identical bytes race here and the loser downgrades to duplicate.
        CREATE UNIQUE INDEX IF NOT EXISTS files_processed_hash
            ON files(file_hash) WHERE status = 'processed';
        CREATE INDEX IF NOT EXISTS files_hash ON files(file_hash);

        CREATE TABLE IF NOT EXISTS chunks (
            id                TEXT PRIMARY KEY,
            file_id           TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            business_id       TEXT NOT NULL,
            chunk_index       INTEGER NOT NULL,
            text              TEXT NOT NULL,
            cleaned_text      TEXT NOT NULL,
            tokens            INTEGER NOT NULL,
            source_type       TEXT NOT NULL,
            metadata          TEXT NOT NULL DEFAULT '{}',
            confidence        REAL NOT NULL,
            semantic_hash     TEXT NOT NULL,
            global_content_id TEXT,
            reasoning         TEXT NOT NULL,
            is_duplicate      INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            UNIQUE (file_id, semantic_hash),
            UNIQUE (file_id, chunk_index)
        );
        CREATE INDEX IF NOT EXISTS chunks_semantic_hash ON chunks(semantic_hash);

        CREATE TABLE IF NOT EXISTS global_content (
            id                 TEXT PRIMARY KEY,
            semantic_hash      TEXT NOT NULL UNIQUE,
            cleaned_text       TEXT NOT NULL,
            raw_text           TEXT NOT NULL,
            tokens             INTEGER NOT NULL,
            business_id        TEXT NOT NULL,
            first_seen_file_id TEXT NOT NULL,
            source_type        TEXT NOT NULL,
            occurrence_count   INTEGER NOT NULL DEFAULT 1,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS taxonomy_categories (
            id             TEXT PRIMARY KEY,
            name           TEXT NOT NULL COLLATE NOCASE,
            category_group TEXT NOT NULL,
            description    TEXT NOT NULL DEFAULT '',
            synonyms       TEXT NOT NULL DEFAULT '[]',
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL,
            UNIQUE (category_group, name)
        );

        CREATE TABLE IF NOT EXISTS entity_links (
            id             TEXT PRIMARY KEY,
            entity_type    TEXT NOT NULL,
            entity_id      TEXT NOT NULL,
            category_id    TEXT NOT NULL REFERENCES taxonomy_categories(id),
            subcategory_id TEXT,
            business_id    TEXT NOT NULL,
            fingerprint    TEXT NOT NULL UNIQUE,
            created_at     TEXT NOT NULL,
            UNIQUE (entity_type, entity_id)
        );

        CREATE TABLE IF NOT EXISTS ingest_sources (
            id               TEXT PRIMARY KEY,
            feed_url         TEXT NOT NULL UNIQUE,
            entries_seen     INTEGER NOT NULL DEFAULT 0,
            entries_ingested INTEGER NOT NULL DEFAULT 0,
            failures         INTEGER NOT NULL DEFAULT 0,
            status           TEXT NOT NULL DEFAULT 'idle',
            avg_confidence   REAL NOT NULL DEFAULT 0.0,
            last_run_at      TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        "#,
    )
}

// ---- row mapping ----

const SELECT_FILE: &str = "SELECT id, business_id, file_name, file_type, source, metadata, \
     parser_used, status, total_chunks, unique_chunks, duplicate_chunks, dedup_ratio, \
     error_message, created_at, updated_at FROM files";

const SELECT_CHUNK: &str = "SELECT id, file_id, business_id, chunk_index, text, cleaned_text, \
     tokens, source_type, metadata, confidence, semantic_hash, global_content_id, reasoning, \
     is_duplicate, created_at FROM chunks";

const SELECT_GLOBAL: &str = "SELECT id, semantic_hash, cleaned_text, raw_text, tokens, \
     business_id, first_seen_file_id, source_type, occurrence_count, created_at, updated_at \
     FROM global_content";

const SELECT_SOURCE: &str = "SELECT id, feed_url, entries_seen, entries_ingested, failures, \
     status, avg_confidence, last_run_at, created_at, updated_at FROM ingest_sources";

fn corrupt(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[derive(Debug, Error)]
#[error("invalid enum value: {0}")]
struct EnumParse(String);

fn row_uuid(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| corrupt(idx, e))
}

fn row_uuid_opt(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Uuid::parse_str(&s).map_err(|e| corrupt(idx, e)))
        .transpose()
}

fn row_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(idx, e))
}

fn row_ts_opt(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(idx, e))
    })
    .transpose()
}

fn file_from_row(row: &Row) -> rusqlite::Result<FileRecord> {
    let file_type: String = row.get(3)?;
    let status: String = row.get(7)?;
    let metadata: String = row.get(5)?;
    Ok(FileRecord {
        id: row_uuid(row, 0)?,
        business_id: row_uuid(row, 1)?,
        file_name: row.get(2)?,
        file_type: FileType::parse(&file_type).ok_or_else(|| corrupt(3, EnumParse(file_type)))?,
        source: row.get(4)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| corrupt(5, e))?,
        parser_used: row.get(6)?,
        status: FileStatus::parse(&status).ok_or_else(|| corrupt(7, EnumParse(status)))?,
        total_chunks: row.get(8)?,
        unique_chunks: row.get(9)?,
        duplicate_chunks: row.get(10)?,
        dedup_ratio: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row_ts(row, 13)?,
        updated_at: row_ts(row, 14)?,
    })
}

fn chunk_from_row(row: &Row) -> rusqlite::Result<ChunkRecord> {
    let source_type: String = row.get(7)?;
    let metadata: String = row.get(8)?;
    let reasoning: String = row.get(12)?;
    Ok(ChunkRecord {
        id: row_uuid(row, 0)?,
        file_id: row_uuid(row, 1)?,
        business_id: row_uuid(row, 2)?,
        chunk_index: row.get(3)?,
        text: row.get(4)?,
        cleaned_text: row.get(5)?,
        tokens: row.get(6)?,
        source_type: FileType::parse(&source_type)
            .ok_or_else(|| corrupt(7, EnumParse(source_type)))?,
        metadata: serde_json::from_str(&metadata).map_err(|e| corrupt(8, e))?,
        confidence: row.get(9)?,
        semantic_hash: row.get(10)?,
        global_content_id: row_uuid_opt(row, 11)?,
        reasoning: serde_json::from_str(&reasoning).map_err(|e| corrupt(12, e))?,
        is_duplicate: row.get::<_, i64>(13)? != 0,
        created_at: row_ts(row, 14)?,
    })
}

fn global_from_row(row: &Row) -> rusqlite::Result<GlobalContentEntry> {
    let source_type: String = row.get(7)?;
    Ok(GlobalContentEntry {
        id: row_uuid(row, 0)?,
        semantic_hash: row.get(1)?,
        cleaned_text: row.get(2)?,
        raw_text: row.get(3)?,
        tokens: row.get(4)?,
        business_id: row_uuid(row, 5)?,
        first_seen_file_id: row_uuid(row, 6)?,
        source_type: FileType::parse(&source_type)
            .ok_or_else(|| corrupt(7, EnumParse(source_type)))?,
        occurrence_count: row.get(8)?,
        created_at: row_ts(row, 9)?,
        updated_at: row_ts(row, 10)?,
    })
}

fn source_from_row(row: &Row) -> rusqlite::Result<IngestSource> {
    let status: String = row.get(5)?;
    Ok(IngestSource {
        id: row_uuid(row, 0)?,
        feed_url: row.get(1)?,
        entries_seen: row.get(2)?,
        entries_ingested: row.get(3)?,
        failures: row.get(4)?,
        status: FeedStatus::parse(&status).ok_or_else(|| corrupt(5, EnumParse(status)))?,
        avg_confidence: row.get(6)?,
        last_run_at: row_ts_opt(row, 7)?,
        created_at: row_ts(row, 8)?,
        updated_at: row_ts(row, 9)?,
    })
}

pub(crate) fn now_str() -> String {
    ts_str(Utc::now())
}

pub(crate) fn ts_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_core::model::DEFAULT_BUSINESS_NAME;

    async fn open_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.db")).await.unwrap();
        (dir, catalog)
    }

    async fn seeded_file(catalog: &Catalog, hash: &str) -> FileRecord {
        let business = catalog
            .ensure_business(DEFAULT_BUSINESS_NAME.to_string())
            .await
            .unwrap();
        let mut record = FileRecord::new(business, "a.txt", FileType::Txt, "/tmp/a.txt");
        record.set_file_hash(hash);
        catalog.insert_file(record.clone()).await.unwrap();
        catalog
            .set_file_hash(record.id, hash.to_string())
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn file_round_trip_preserves_every_field() {
        let (_dir, catalog) = open_catalog().await;
        let record = seeded_file(&catalog, "abc").await;

        let loaded = catalog.get_file(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.file_name, "a.txt");
        assert_eq!(loaded.file_type, FileType::Txt);
        assert_eq!(loaded.status, FileStatus::Uploaded);
        assert_eq!(loaded.file_hash(), Some("abc"));
    }

    #[tokio::test]
    async fn acquire_moves_uploaded_to_processing_exactly_once() {
        let (_dir, catalog) = open_catalog().await;
        let record = seeded_file(&catalog, "abc").await;

        assert!(catalog.acquire_file(record.id).await.unwrap());
        assert!(!catalog.acquire_file(record.id).await.unwrap());
        let loaded = catalog.get_file(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, FileStatus::Processing);
    }

    #[tokio::test]
    async fn only_one_processed_record_per_file_hash() {
        let (_dir, catalog) = open_catalog().await;
        let first = seeded_file(&catalog, "same-hash").await;
        let second = seeded_file(&catalog, "same-hash").await;

        assert!(catalog
            .try_mark_processed(first.id, 3, 3, 0, 0.0)
            .await
            .unwrap());
        // Second flip hits the partial unique index and reports the lost race.
        assert!(!catalog
            .try_mark_processed(second.id, 3, 3, 0, 0.0)
            .await
            .unwrap());

        let hit = catalog
            .find_processed_with_hash("same-hash".to_string(), second.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, first.id);
    }

    #[tokio::test]
    async fn global_upsert_then_conditional_increment() {
        let (_dir, catalog) = open_catalog().await;
        let record = seeded_file(&catalog, "h").await;

        let entry = GlobalContentEntry {
            id: Uuid::new_v4(),
            semantic_hash: "hash-1".to_string(),
            cleaned_text: "text".to_string(),
            raw_text: "text".to_string(),
            tokens: 1,
            business_id: record.business_id,
            first_seen_file_id: record.id,
            source_type: FileType::Txt,
            occurrence_count: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let (first_id, inserted) = catalog
            .with_conn({
                let entry = entry.clone();
                move |conn| upsert_global(conn, &entry)
            })
            .await
            .unwrap();
        assert!(inserted);

        let (second_id, inserted) = catalog
            .with_conn({
                let entry = entry.clone();
                move |conn| upsert_global(conn, &entry)
            })
            .await
            .unwrap();
        assert!(!inserted);
        assert_eq!(first_id, second_id);

        let bumped = catalog
            .with_conn(|conn| increment_occurrence(conn, "hash-1"))
            .await
            .unwrap();
        assert!(bumped);
        let loaded = catalog
            .global_entry("hash-1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.occurrence_count, 2);

        let missing = catalog
            .with_conn(|conn| increment_occurrence(conn, "absent"))
            .await
            .unwrap();
        assert!(!missing);
    }

    #[tokio::test]
    async fn requeue_stale_resets_old_processing_files() {
        let (_dir, catalog) = open_catalog().await;
        let record = seeded_file(&catalog, "stale").await;
        assert!(catalog.acquire_file(record.id).await.unwrap());

        // Nothing is stale under a generous grace period.
        let stale = catalog.requeue_stale(Duration::hours(1)).await.unwrap();
        assert!(stale.is_empty());

        // With a zero grace period the in-flight record is reclaimed.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let stale = catalog.requeue_stale(Duration::zero()).await.unwrap();
        assert_eq!(stale.len(), 1);
        let loaded = catalog.get_file(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, FileStatus::Uploaded);
    }

    #[tokio::test]
    async fn feed_metrics_accumulate_across_runs() {
        let (_dir, catalog) = open_catalog().await;
        let url = "https://example.com/feed.xml".to_string();
        catalog.ensure_source(url.clone()).await.unwrap();
        catalog
            .record_feed_run(url.clone(), 5, 4, 1, FeedStatus::Partial, 0.8)
            .await
            .unwrap();
        catalog
            .record_feed_run(url.clone(), 3, 3, 0, FeedStatus::Active, 0.9)
            .await
            .unwrap();

        let sources = catalog.list_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].entries_seen, 8);
        assert_eq!(sources[0].entries_ingested, 7);
        assert_eq!(sources[0].failures, 1);
        assert_eq!(sources[0].status, FeedStatus::Active);

        catalog.reset_sources().await.unwrap();
        let sources = catalog.list_sources().await.unwrap();
        assert_eq!(sources[0].entries_seen, 0);
        assert_eq!(sources[0].status, FeedStatus::Idle);
    }
}
