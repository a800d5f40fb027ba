use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use super::{CarveStore, InsertOutcome};
use crate::model::{CarveChunk, CarveSession, CarveStatus, SessionBinding, SessionFilter};
use carver_types::error::{CarveError, Result};

const SESSION_COLUMNS: &str = "carve_id, request_id, session_id, node_uuid, environment, \
     query_name, path, carve_size, block_size, total_blocks, completed_blocks, status, carver, \
     archived, archive_path, archive_size, completed_at, created_at, updated_at, deleted_at";

const CHUNK_COLUMNS: &str = "request_id, session_id, environment, sequence, data, size, carver, \
     created_at, updated_at, deleted_at";

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> CarveError + '_ {
    move |e| CarveError::Persistence(format!("{context}: {e}"))
}

/// Record store backed by a SQLite database file.
///
/// A connection is opened per operation; counters are updated inside
/// `IMMEDIATE` transactions so concurrent writers from other processes
/// serialise on the database lock.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { path };
        let conn = store.connection()?;
        init_schema(&conn)?;
        tracing::debug!(path = %store.path.display(), "opened carve database");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            CarveError::Persistence(format!(
                "failed to open carve database at {}: {e}",
                self.path.display()
            ))
        })?;
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(db_err("failed to set busy timeout"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err("failed to enable WAL"))?;
        Ok(conn)
    }

    fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("failed to start transaction"))?;
        let result = f(&tx)?;
        tx.commit().map_err(db_err("failed to commit transaction"))?;
        Ok(result)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS carved_files (
            carve_id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            session_id TEXT,
            node_uuid TEXT NOT NULL,
            environment TEXT NOT NULL,
            query_name TEXT NOT NULL,
            path TEXT NOT NULL,
            carve_size INTEGER NOT NULL DEFAULT 0,
            block_size INTEGER NOT NULL DEFAULT 0,
            total_blocks INTEGER NOT NULL DEFAULT 0,
            completed_blocks INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            carver TEXT NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            archive_path TEXT,
            archive_size INTEGER NOT NULL DEFAULT 0,
            completed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS carved_files_request ON carved_files(request_id);
        CREATE INDEX IF NOT EXISTS carved_files_session ON carved_files(session_id);
        CREATE TABLE IF NOT EXISTS carved_blocks (
            request_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            environment TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            data TEXT NOT NULL,
            size INTEGER NOT NULL,
            carver TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            PRIMARY KEY(session_id, sequence)
        );
        "#,
    )
    .map_err(db_err("failed to initialize carve schema"))
}

/// Row as stored; tags are parsed after the row is read so that unknown
/// values surface as typed errors.
struct SessionRow {
    session: CarveSession,
    status: String,
    carver: String,
}

fn read_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let archive_path: Option<String> = row.get(14)?;
    Ok(SessionRow {
        session: CarveSession {
            carve_id: row.get(0)?,
            request_id: row.get(1)?,
            session_id: row.get(2)?,
            node_uuid: row.get(3)?,
            environment: row.get(4)?,
            query_name: row.get(5)?,
            path: row.get(6)?,
            carve_size: row.get::<_, i64>(7)? as u64,
            block_size: row.get::<_, i64>(8)? as u64,
            total_blocks: row.get(9)?,
            completed_blocks: row.get(10)?,
            status: CarveStatus::Queried,
            carver: Default::default(),
            archived: row.get(13)?,
            archive_path: archive_path.map(PathBuf::from),
            archive_size: row.get::<_, i64>(15)? as u64,
            completed_at: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
            deleted_at: row.get(19)?,
        },
        status: row.get(11)?,
        carver: row.get(12)?,
    })
}

impl SessionRow {
    fn into_session(self) -> Result<CarveSession> {
        let mut session = self.session;
        session.status = self.status.parse()?;
        session.carver = self.carver.parse()?;
        Ok(session)
    }
}

struct ChunkRow {
    chunk: CarveChunk,
    carver: String,
}

fn read_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        chunk: CarveChunk {
            request_id: row.get(0)?,
            session_id: row.get(1)?,
            environment: row.get(2)?,
            sequence: row.get(3)?,
            data: row.get(4)?,
            size: row.get::<_, i64>(5)? as u64,
            carver: Default::default(),
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            deleted_at: row.get(9)?,
        },
        carver: row.get(6)?,
    })
}

impl CarveStore for SqliteStore {
    fn insert_session(&self, session: &CarveSession) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            &format!(
                "INSERT INTO carved_files ({SESSION_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                session.carve_id,
                session.request_id,
                session.session_id,
                session.node_uuid,
                session.environment,
                session.query_name,
                session.path,
                session.carve_size as i64,
                session.block_size as i64,
                session.total_blocks,
                session.completed_blocks,
                session.status.as_str(),
                session.carver.as_str(),
                session.archived,
                session
                    .archive_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                session.archive_size as i64,
                session.completed_at,
                session.created_at,
                session.updated_at,
                session.deleted_at,
            ],
        )
        .map_err(|e| {
            CarveError::Persistence(format!("failed to insert carve '{}': {e}", session.carve_id))
        })?;
        Ok(())
    }

    fn sessions(&self, filter: &SessionFilter) -> Result<Vec<CarveSession>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        for (column, value) in [
            ("carve_id", &filter.carve_id),
            ("request_id", &filter.request_id),
            ("session_id", &filter.session_id),
            ("node_uuid", &filter.node_uuid),
            ("query_name", &filter.query_name),
        ] {
            if let Some(value) = value {
                values.push(value.clone());
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }
        if !filter.include_deleted {
            clauses.push("deleted_at IS NULL".to_string());
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM carved_files {where_clause} \
                 ORDER BY created_at, carve_id"
            ))
            .map_err(db_err("failed to prepare session query"))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), read_session)
            .map_err(db_err("failed to query sessions"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read session row"))?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    fn bind_pending(
        &self,
        request_id: &str,
        binding: &SessionBinding,
    ) -> Result<Vec<CarveSession>> {
        let rows = self.with_immediate_tx(|tx| {
            let updated = tx
                .execute(
                    "UPDATE carved_files SET session_id = ?2, carve_size = ?3, block_size = ?4, \
                     total_blocks = ?5, carver = ?6, status = ?7, updated_at = ?8 \
                     WHERE request_id = ?1 AND deleted_at IS NULL AND status IN (?9, ?10)",
                    params![
                        request_id,
                        binding.session_id,
                        binding.carve_size as i64,
                        binding.block_size as i64,
                        binding.total_blocks,
                        binding.carver.as_str(),
                        CarveStatus::InProgress.as_str(),
                        Utc::now(),
                        CarveStatus::Queried.as_str(),
                        CarveStatus::Scheduled.as_str(),
                    ],
                )
                .map_err(db_err("failed to bind session"))?;
            if updated == 0 {
                return Ok(Vec::new());
            }
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM carved_files \
                     WHERE request_id = ?1 AND session_id = ?2 AND deleted_at IS NULL \
                     ORDER BY created_at, carve_id"
                ))
                .map_err(db_err("failed to prepare bound session query"))?;
            let rows = stmt
                .query_map(params![request_id, binding.session_id], read_session)
                .map_err(db_err("failed to query bound sessions"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("failed to read bound session row"))?;
            Ok(rows)
        })?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    fn increment_completed(&self, session_id: &str) -> Result<u32> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE carved_files SET completed_blocks = completed_blocks + 1, updated_at = ?2 \
                 WHERE session_id = ?1 AND deleted_at IS NULL \
                 AND completed_blocks < total_blocks",
                params![session_id, Utc::now()],
            )
            .map_err(db_err("failed to count completed chunk"))?;
            let count: Option<u32> = tx
                .query_row(
                    "SELECT MAX(completed_blocks) FROM carved_files \
                     WHERE session_id = ?1 AND deleted_at IS NULL",
                    params![session_id],
                    |row| row.get(0),
                )
                .map_err(db_err("failed to read completed chunks"))?;
            count.ok_or_else(|| CarveError::NotFound(format!("session '{session_id}'")))
        })
    }

    fn set_status(
        &self,
        session_id: &str,
        status: CarveStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.connection()?;
        let updated = conn
            .execute(
                "UPDATE carved_files SET status = ?2, \
                 completed_at = COALESCE(?3, completed_at), updated_at = ?4 \
                 WHERE session_id = ?1 AND deleted_at IS NULL",
                params![session_id, status.as_str(), completed_at, Utc::now()],
            )
            .map_err(db_err("failed to update status"))?;
        if updated == 0 {
            return Err(CarveError::NotFound(format!("session '{session_id}'")));
        }
        Ok(())
    }

    fn mark_archived(&self, session_id: &str, path: &Path, size: u64) -> Result<()> {
        let path_text = path.to_string_lossy().into_owned();
        self.with_immediate_tx(|tx| {
            let existing: Vec<(bool, Option<String>)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT archived, archive_path FROM carved_files \
                         WHERE session_id = ?1 AND deleted_at IS NULL",
                    )
                    .map_err(db_err("failed to prepare archive lookup"))?;
                let rows = stmt
                    .query_map(params![session_id], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(db_err("failed to look up archive state"))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err("failed to read archive state"))?;
                rows
            };
            if existing.is_empty() {
                return Err(CarveError::NotFound(format!("session '{session_id}'")));
            }
            if existing
                .iter()
                .any(|(archived, p)| *archived && p.as_deref() != Some(path_text.as_str()))
            {
                return Err(CarveError::Persistence(format!(
                    "session '{session_id}' is already archived elsewhere"
                )));
            }
            tx.execute(
                "UPDATE carved_files SET archived = 1, archive_path = ?2, archive_size = ?3, \
                 updated_at = ?4 WHERE session_id = ?1 AND deleted_at IS NULL AND archived = 0",
                params![session_id, path_text, size as i64, Utc::now()],
            )
            .map_err(db_err("failed to mark archived"))?;
            Ok(())
        })
    }

    fn soft_delete_session(&self, carve_id: &str) -> Result<bool> {
        self.with_immediate_tx(|tx| {
            let bound: Option<Option<String>> = tx
                .query_row(
                    "SELECT session_id FROM carved_files \
                     WHERE carve_id = ?1 AND deleted_at IS NULL",
                    params![carve_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err("failed to look up carve"))?;
            let Some(session_id) = bound else {
                return Ok(false);
            };
            let now = Utc::now();
            tx.execute(
                "UPDATE carved_files SET deleted_at = ?2, updated_at = ?2 WHERE carve_id = ?1",
                params![carve_id, now],
            )
            .map_err(db_err("failed to soft-delete carve"))?;
            if let Some(session_id) = session_id {
                tx.execute(
                    "UPDATE carved_blocks SET deleted_at = ?2, updated_at = ?2 \
                     WHERE session_id = ?1 AND deleted_at IS NULL \
                     AND NOT EXISTS (SELECT 1 FROM carved_files \
                     WHERE session_id = ?1 AND deleted_at IS NULL)",
                    params![session_id, now],
                )
                .map_err(db_err("failed to soft-delete chunks"))?;
            }
            Ok(true)
        })
    }

    fn delete_session(&self, carve_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let removed = conn
            .execute("DELETE FROM carved_files WHERE carve_id = ?1", params![carve_id])
            .map_err(db_err("failed to delete carve"))?;
        Ok(removed > 0)
    }

    fn insert_chunk(&self, chunk: &CarveChunk) -> Result<InsertOutcome> {
        let conn = self.connection()?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO carved_blocks ({CHUNK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    chunk.request_id,
                    chunk.session_id,
                    chunk.environment,
                    chunk.sequence,
                    chunk.data,
                    chunk.size as i64,
                    chunk.carver.as_str(),
                    chunk.created_at,
                    chunk.updated_at,
                    chunk.deleted_at,
                ],
            )
            .map_err(|e| {
                CarveError::Persistence(format!(
                    "failed to insert chunk {} of session '{}': {e}",
                    chunk.sequence, chunk.session_id
                ))
            })?;
        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    fn chunks(&self, session_id: &str) -> Result<Vec<CarveChunk>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM carved_blocks \
                 WHERE session_id = ?1 AND deleted_at IS NULL ORDER BY sequence"
            ))
            .map_err(db_err("failed to prepare chunk query"))?;
        let rows = stmt
            .query_map(params![session_id], read_chunk)
            .map_err(db_err("failed to query chunks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("failed to read chunk row"))?;
        rows.into_iter()
            .map(|row| {
                let mut chunk = row.chunk;
                chunk.carver = row.carver.parse()?;
                Ok(chunk)
            })
            .collect()
    }

    fn delete_chunks(&self, session_id: &str) -> Result<usize> {
        let conn = self.connection()?;
        conn.execute(
            "DELETE FROM carved_blocks WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(db_err("failed to delete chunks"))
    }
}
