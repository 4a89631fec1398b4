//! Restart checkpoints.
//!
//! The supervisor is the only writer; an iterator reads its own checkpoint
//! once at startup and resumes from the seq# after it. One record is kept per
//! iterator and its seq# never decreases: recording a lower seq# (for example
//! one recomputed from a stale status) is accepted and ignored, so the
//! supervisor loop stays idempotent.

mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteCheckpointStore;

use crate::types::{IteratorId, SeqNum};

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CheckpointError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The seq# cannot be represented by the backend.
    #[error("checkpoint seq# {seq} is out of range")]
    SeqOutOfRange {
        /// The offending sequence number.
        seq: SeqNum,
    },

    /// A blocking task panicked or the lock was poisoned.
    #[error("checkpoint task failed: {0}")]
    Task(String),
}

/// Supervisor-recorded resume point for one iterator.
///
/// `seq` is the iterator's high-water seq#: everything at or below it was
/// resolved against the store, so a restart resumes at `seq + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The iterator this checkpoint belongs to.
    pub iterator_id: IteratorId,
    /// Highest seq# known resolved.
    pub seq: SeqNum,
    /// When the supervisor recorded it.
    pub recorded_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint stamped with the current time.
    #[must_use]
    pub fn now(iterator_id: IteratorId, seq: SeqNum) -> Self {
        Self {
            iterator_id,
            seq,
            recorded_at: Utc::now(),
        }
    }

    /// First seq# a restarted iterator should fetch.
    #[must_use]
    pub const fn resume_seq(&self) -> SeqNum {
        self.seq.saturating_add(1)
    }
}

/// What happened to a recorded checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWrite {
    /// The stored seq# moved forward (or the first record was written).
    Advanced {
        /// Previously stored seq#, if any.
        previous: Option<SeqNum>,
    },
    /// The same seq# was already stored.
    Unchanged,
    /// A higher seq# is already stored; the write was ignored.
    Stale {
        /// The seq# that stays in place.
        current: SeqNum,
    },
}

impl CheckpointWrite {
    fn classify(previous: Option<SeqNum>, seq: SeqNum) -> Self {
        match previous {
            Some(current) if current > seq => Self::Stale { current },
            Some(current) if current == seq => Self::Unchanged,
            previous => Self::Advanced { previous },
        }
    }
}

/// Durable latest-wins checkpoint storage keyed by iterator id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint for `iterator_id`, if one was ever recorded.
    async fn load(&self, iterator_id: &IteratorId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Records `checkpoint` unless a higher seq# is already stored.
    async fn record(&self, checkpoint: &Checkpoint) -> Result<CheckpointWrite, CheckpointError>;

    /// Lists every stored checkpoint ordered by iterator id.
    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError>;
}

/// Process-local [`CheckpointStore`] for tests.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: Mutex<HashMap<IteratorId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<IteratorId, Checkpoint>>, CheckpointError> {
        self.records
            .lock()
            .map_err(|_| CheckpointError::Task("checkpoint lock poisoned".into()))
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, iterator_id: &IteratorId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.records()?.get(iterator_id).cloned())
    }

    async fn record(&self, checkpoint: &Checkpoint) -> Result<CheckpointWrite, CheckpointError> {
        let mut records = self.records()?;
        let previous = records.get(&checkpoint.iterator_id).map(|c| c.seq);
        let write = CheckpointWrite::classify(previous, checkpoint.seq);
        if matches!(write, CheckpointWrite::Advanced { .. }) {
            records.insert(checkpoint.iterator_id.clone(), checkpoint.clone());
        }
        Ok(write)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let mut all: Vec<_> = self.records()?.values().cloned().collect();
        all.sort_by(|a, b| a.iterator_id.cmp(&b.iterator_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoints_never_move_backwards() {
        let store = InMemoryCheckpointStore::new();
        let id = IteratorId::from("a");

        assert_eq!(store.load(&id).await.unwrap(), None);
        assert_eq!(
            store.record(&Checkpoint::now(id.clone(), 10)).await.unwrap(),
            CheckpointWrite::Advanced { previous: None }
        );
        assert_eq!(
            store.record(&Checkpoint::now(id.clone(), 10)).await.unwrap(),
            CheckpointWrite::Unchanged
        );
        assert_eq!(
            store.record(&Checkpoint::now(id.clone(), 7)).await.unwrap(),
            CheckpointWrite::Stale { current: 10 }
        );
        assert_eq!(
            store.record(&Checkpoint::now(id.clone(), 12)).await.unwrap(),
            CheckpointWrite::Advanced { previous: Some(10) }
        );

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.seq, 12);
        assert_eq!(loaded.resume_seq(), 13);
    }
}
