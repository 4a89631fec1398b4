//! `SQLite`-backed checkpoint store.

#![allow(clippy::cast_sign_loss)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use super::{Checkpoint, CheckpointError, CheckpointStore, CheckpointWrite};
use crate::types::{IteratorId, SeqNum};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Checkpoints persisted in a `SQLite` database file.
///
/// The supervisor opens it read-write; iterators open the same file at
/// startup to load their resume point.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").finish_non_exhaustive()
    }
}

impl SqliteCheckpointStore {
    /// Opens or creates a checkpoint database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn)
    }

    /// Creates an in-memory checkpoint database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, CheckpointError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CheckpointError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| CheckpointError::Task("checkpoint connection lock poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CheckpointError::Task(e.to_string()))?
    }
}

fn row_to_checkpoint(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let recorded_at_ms: i64 = row.get(2)?;
    Ok(Checkpoint {
        iterator_id: IteratorId::new(row.get::<_, String>(0)?),
        seq: row.get::<_, i64>(1)? as SeqNum,
        recorded_at: DateTime::<Utc>::from_timestamp_millis(recorded_at_ms).unwrap_or_default(),
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, iterator_id: &IteratorId) -> Result<Option<Checkpoint>, CheckpointError> {
        let id = iterator_id.as_str().to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT iterator_id, seq, recorded_at FROM checkpoints WHERE iterator_id = ?1",
                    params![id],
                    row_to_checkpoint,
                )
                .optional()?)
        })
        .await
    }

    async fn record(&self, checkpoint: &Checkpoint) -> Result<CheckpointWrite, CheckpointError> {
        let id = checkpoint.iterator_id.as_str().to_string();
        let seq = i64::try_from(checkpoint.seq).map_err(|_| CheckpointError::SeqOutOfRange {
            seq: checkpoint.seq,
        })?;
        let recorded_at = checkpoint.recorded_at.timestamp_millis();
        let new_seq = checkpoint.seq;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM checkpoints WHERE iterator_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let write = CheckpointWrite::classify(previous.map(|s| s as SeqNum), new_seq);
            if matches!(write, CheckpointWrite::Advanced { .. }) {
                tx.execute(
                    "INSERT INTO checkpoints (iterator_id, seq, recorded_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (iterator_id) DO UPDATE
                     SET seq = excluded.seq, recorded_at = excluded.recorded_at
                     WHERE excluded.seq > checkpoints.seq",
                    params![id, seq, recorded_at],
                )?;
            }
            tx.commit()?;
            Ok(write)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT iterator_id, seq, recorded_at FROM checkpoints ORDER BY iterator_id ASC",
            )?;
            let all = stmt
                .query_map([], row_to_checkpoint)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(all)
        })
        .await
    }
}
