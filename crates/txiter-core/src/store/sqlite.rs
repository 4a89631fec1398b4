//! `SQLite`-backed digest store.
//!
//! WAL mode lets several iterator processes on one host share the file: the
//! `(entity, seq)` primary key plus `ON CONFLICT DO NOTHING` gives the
//! insert-if-absent contract without any external locking.

// SQLite stores integers as i64; seq# and timestamps are range checked on
// the way in and are non-negative on the way out.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::{DigestStore, InsertOutcome, StoreError};
use crate::types::{Digest, SeqDigestEntry, SeqNum};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a writer waits for a competing process' lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Digest store persisted in a `SQLite` database file.
#[derive(Clone)]
pub struct SqliteDigestStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteDigestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDigestStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteDigestStore {
    /// Opens or creates a store at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Task("sqlite connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn to_sql_seq(seq: SeqNum) -> Result<i64, StoreError> {
    i64::try_from(seq).map_err(|_| StoreError::SeqOutOfRange { seq })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn read_digest(conn: &Connection, entity: &str, seq: i64) -> Result<Option<Digest>, StoreError> {
    let digest = conn
        .query_row(
            "SELECT digest FROM digests WHERE entity = ?1 AND seq = ?2",
            params![entity, seq],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(digest.map(Digest::from))
}

#[async_trait]
impl DigestStore for SqliteDigestStore {
    async fn insert_if_absent(
        &self,
        entity: &str,
        entry: &SeqDigestEntry,
    ) -> Result<InsertOutcome, StoreError> {
        let entity = entity.to_string();
        let seq = to_sql_seq(entry.seq)?;
        let digest = entry.digest.clone();

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO digests (entity, seq, digest, inserted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (entity, seq) DO NOTHING",
                params![entity, seq, digest.as_bytes(), now_millis()],
            )?;
            if inserted == 1 {
                return Ok(InsertOutcome::Inserted);
            }

            // Rows are never deleted, so the row that beat us is still there.
            match read_digest(conn, &entity, seq)? {
                Some(existing) if existing == digest => Ok(InsertOutcome::AlreadyPresentSame),
                Some(existing) => Ok(InsertOutcome::Conflict { existing }),
                None => Err(StoreError::Unavailable(format!(
                    "insert of seq# {seq} was ignored but no row exists"
                ))),
            }
        })
        .await
    }

    async fn get(&self, entity: &str, seq: SeqNum) -> Result<Option<Digest>, StoreError> {
        let entity = entity.to_string();
        let seq = to_sql_seq(seq)?;
        self.with_conn(move |conn| read_digest(conn, &entity, seq))
            .await
    }

    async fn scan_from(
        &self,
        entity: &str,
        from: SeqNum,
        limit: usize,
    ) -> Result<Vec<SeqDigestEntry>, StoreError> {
        let entity = entity.to_string();
        // Anything past i64::MAX cannot be stored, so the scan is empty.
        let Ok(from) = i64::try_from(from) else {
            return Ok(Vec::new());
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT seq, digest FROM digests
                 WHERE entity = ?1 AND seq >= ?2
                 ORDER BY seq ASC
                 LIMIT ?3",
            )?;
            let entries = stmt
                .query_map(params![entity, from, limit], |row| {
                    Ok(SeqDigestEntry::new(
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, Vec<u8>>(1)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}
