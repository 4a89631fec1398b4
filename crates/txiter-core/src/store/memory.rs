//! In-memory digest store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DigestStore, InsertOutcome, StoreError};
use crate::types::{Digest, SeqDigestEntry, SeqNum};

/// Process-local [`DigestStore`] used by tests and single-host experiments.
///
/// Availability can be toggled to simulate a store outage: while unavailable,
/// every call fails with [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct InMemoryDigestStore {
    entries: Mutex<BTreeMap<(String, SeqNum), Digest>>,
    available: AtomicBool,
}

impl Default for InMemoryDigestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDigestStore {
    /// Creates an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of committed entries across all entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether nothing has been committed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, SeqNum), Digest>>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        self.entries
            .lock()
            .map_err(|_| StoreError::Task("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl DigestStore for InMemoryDigestStore {
    async fn insert_if_absent(
        &self,
        entity: &str,
        entry: &SeqDigestEntry,
    ) -> Result<InsertOutcome, StoreError> {
        let mut entries = self.entries()?;
        let key = (entity.to_string(), entry.seq);

        match entries.get(&key) {
            Some(existing) if *existing == entry.digest => Ok(InsertOutcome::AlreadyPresentSame),
            Some(existing) => Ok(InsertOutcome::Conflict {
                existing: existing.clone(),
            }),
            None => {
                entries.insert(key, entry.digest.clone());
                Ok(InsertOutcome::Inserted)
            },
        }
    }

    async fn get(&self, entity: &str, seq: SeqNum) -> Result<Option<Digest>, StoreError> {
        let entries = self.entries()?;
        Ok(entries.get(&(entity.to_string(), seq)).cloned())
    }

    async fn scan_from(
        &self,
        entity: &str,
        from: SeqNum,
        limit: usize,
    ) -> Result<Vec<SeqDigestEntry>, StoreError> {
        let entries = self.entries()?;
        Ok(entries
            .range((entity.to_string(), from)..=(entity.to_string(), SeqNum::MAX))
            .take(limit)
            .map(|((_, seq), digest)| SeqDigestEntry::new(*seq, digest.clone()))
            .collect())
    }
}
