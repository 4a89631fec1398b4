//! Digest store capability.
//!
//! The store is an ordered mapping `(entity, seq#) -> digest` shared by every
//! iterator tracking the same entity. Its only write primitive is
//! insert-if-absent: a second insert with the same digest is a no-op, a
//! second insert with a different digest is reported as a conflict and never
//! overwrites. Concurrent leaders are therefore safe without any locking.
//!
//! Two backends are provided:
//!
//! - [`SqliteDigestStore`]: WAL-mode `SQLite`, shareable between processes on
//!   the same host.
//! - [`InMemoryDigestStore`]: for tests, with switchable unavailability.

mod memory;
mod sqlite;

use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use thiserror::Error;

pub use memory::InMemoryDigestStore;
pub use sqlite::SqliteDigestStore;

use crate::types::{Digest, SeqDigestEntry, SeqNum};

/// Page size used by [`scan`] when callers do not care.
pub const DEFAULT_SCAN_PAGE: usize = 256;

/// Errors that can occur during digest store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The store cannot be reached.
    #[error("digest store unavailable: {0}")]
    Unavailable(String),

    /// The seq# cannot be represented by the backend.
    #[error("seq# {seq} is out of range for the store")]
    SeqOutOfRange {
        /// The offending sequence number.
        seq: SeqNum,
    },

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was written by this call.
    Inserted,
    /// The same digest was already stored at this seq#.
    AlreadyPresentSame,
    /// A different digest is stored at this seq#; nothing was written.
    Conflict {
        /// The digest the store holds.
        existing: Digest,
    },
}

impl InsertOutcome {
    /// Whether the store now holds the digest that was offered.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Inserted | Self::AlreadyPresentSame)
    }
}

/// Ordered, shared, insert-only digest storage.
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Stores `entry` under `(entity, entry.seq)` unless a digest is already
    /// present there.
    async fn insert_if_absent(
        &self,
        entity: &str,
        entry: &SeqDigestEntry,
    ) -> Result<InsertOutcome, StoreError>;

    /// Reads the digest stored at `(entity, seq)`.
    async fn get(&self, entity: &str, seq: SeqNum) -> Result<Option<Digest>, StoreError>;

    /// Reads up to `limit` entries with seq# `>= from`, in ascending order.
    async fn scan_from(
        &self,
        entity: &str,
        from: SeqNum,
        limit: usize,
    ) -> Result<Vec<SeqDigestEntry>, StoreError>;
}

/// Lazily pages through the store from `from` up to the current tail.
///
/// The stream is finite: it ends at the first short page. Restart it from any
/// seq# by calling `scan` again.
pub fn scan<'a, S>(
    store: &'a S,
    entity: &'a str,
    from: SeqNum,
    page_size: usize,
) -> impl Stream<Item = Result<SeqDigestEntry, StoreError>> + 'a
where
    S: DigestStore + ?Sized,
{
    let page_size = page_size.max(1);

    stream::try_unfold(Some(from), move |cursor| async move {
        let Some(cursor) = cursor else {
            return Ok::<_, StoreError>(None);
        };

        let page = store.scan_from(entity, cursor, page_size).await?;
        if page.is_empty() {
            return Ok(None);
        }

        let next = if page.len() < page_size {
            None
        } else {
            page.last().and_then(|entry| entry.seq.checked_add(1))
        };

        let items = stream::iter(page.into_iter().map(Ok::<_, StoreError>));
        Ok(Some((items, next)))
    })
    .try_flatten()
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn scan_pages_until_tail() {
        let store = InMemoryDigestStore::new();
        for seq in 0..10 {
            store
                .insert_if_absent("e", &SeqDigestEntry::new(seq, format!("d{seq}").as_str()))
                .await
                .unwrap();
        }

        let entries: Vec<_> = scan(&store, "e", 3, 4).try_collect().await.unwrap();
        let seqs: Vec<_> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn scan_of_empty_range_ends_immediately() {
        let store = InMemoryDigestStore::new();
        let entries: Vec<_> = scan(&store, "e", 0, 4).try_collect().await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn scan_surfaces_store_errors() {
        let store = InMemoryDigestStore::new();
        store.set_available(false);

        let result: Result<Vec<_>, _> = scan(&store, "e", 0, 4).try_collect().await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
