//! Resolution engine.
//!
//! Classifies each observed `(seq#, digest)` against the shared store and
//! decides whether to write it, wait for it, or flag it:
//!
//! - **Leader**: insert-if-absent through the writer store.
//! - **Support**: read the store. A matching digest resolves the seq#; a
//!   different digest is a conflict and is never overwritten; a missing
//!   digest becomes a [`PendingCandidate`] whose first-seen time anchors the
//!   failover timeout.
//!
//! The high-water seq# is the contiguous resolved frontier: every seq# from
//! the origin up to and including it is known to be in the store with the
//! digest this iterator observed (or one an operator accepted). A conflict
//! stops the frontier until it is cleared.
//!
//! [`ResolutionEngine::sweep`] runs on its own cadence: it re-checks
//! conflicts, confirms pending candidates in one scan, and promotes the
//! iterator once the lowest expired candidate is still absent from the
//! writer.
//!
//! Everything tracked above the frontier (pending candidates and seq#s
//! resolved out of order) is bounded by `max_tracked`. Once the bound is
//! reached the engine refuses new seq#s until the frontier moves, which is
//! what keeps a conflict hard stop from accumulating state forever.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::failover::FailoverTimer;
use crate::observer::{NoopObserver, RuntimeObserver};
use crate::role::{Role, RoleError, RoleMachine};
use crate::store::{DigestStore, InsertOutcome, StoreError};
use crate::types::{Digest, SeqDigestEntry, SeqNum};

/// Upper bound on the number of seq#s a single confirmation scan covers.
pub const MAX_CONFIRM_SCAN: usize = 1024;

/// Default bound on seq#s tracked above the frontier.
pub const DEFAULT_MAX_TRACKED: usize = 100_000;

/// An observation the store has not confirmed yet.
///
/// Leaders reuse the table as a backlog of writes that failed because the
/// store was unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCandidate {
    /// Observed seq#.
    pub seq: SeqNum,
    /// Observed digest.
    pub digest: Digest,
    /// When this seq# was first observed unconfirmed. Never reset.
    pub first_seen: Instant,
}

/// A seq# where the store holds a digest other than the observed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// The disputed seq#.
    pub seq: SeqNum,
    /// What this iterator's upstream reported.
    pub observed: Digest,
    /// What the store holds.
    pub stored: Digest,
    /// When the conflict was first detected.
    pub detected_at: DateTime<Utc>,
}

/// How one observation was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Leader committed the digest (or found it already present).
    Written {
        /// Committed seq#.
        seq: SeqNum,
        /// `true` when the store already held the same digest.
        already_present: bool,
    },
    /// Support found the same digest in the store.
    Confirmed {
        /// Confirmed seq#.
        seq: SeqNum,
    },
    /// Not in the store yet; tracked as a pending candidate.
    Pending {
        /// Pending seq#.
        seq: SeqNum,
        /// `false` when a candidate for this seq# already existed.
        new: bool,
        /// `false` when the store read failed.
        store_reachable: bool,
    },
    /// Leader write failed; the entry is queued for the next flush.
    Deferred {
        /// Queued seq#.
        seq: SeqNum,
    },
    /// The store holds a different digest.
    Conflict(ConflictReport),
    /// Already resolved or below the resume point; ignored.
    Stale {
        /// Ignored seq#.
        seq: SeqNum,
    },
}

impl Observation {
    /// The seq# this observation is about.
    #[must_use]
    pub const fn seq(&self) -> SeqNum {
        match self {
            Self::Written { seq, .. }
            | Self::Confirmed { seq }
            | Self::Pending { seq, .. }
            | Self::Deferred { seq }
            | Self::Stale { seq } => *seq,
            Self::Conflict(report) => report.seq,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::Written { .. } => "written",
            Self::Confirmed { .. } => "confirmed",
            Self::Pending { .. } => "pending",
            Self::Deferred { .. } => "deferred",
            Self::Conflict(_) => "conflict",
            Self::Stale { .. } => "stale",
        }
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending candidates confirmed by the store.
    pub confirmed: usize,
    /// Writes committed (backlog flush or post-promotion commit).
    pub committed: usize,
    /// Conflicts that now match the store.
    pub conflicts_cleared: usize,
    /// Conflicts discovered during the sweep.
    pub conflicts_found: usize,
    /// Seq# that triggered promotion, if this sweep promoted.
    pub promoted: Option<SeqNum>,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    /// Current role.
    pub role: Role,
    /// Contiguous resolved frontier; `None` until anything resolved.
    pub high_water_seq: Option<SeqNum>,
    /// Next seq# the frontier waits for.
    pub next_seq: SeqNum,
    /// Number of pending candidates (or queued writes for a leader).
    pub pending: usize,
    /// Outstanding conflicts, ascending by seq#.
    pub conflicts: Vec<ConflictReport>,
    /// Whether the last store operation succeeded.
    pub store_healthy: bool,
}

/// Errors returned by the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The iterator is terminating and accepts no more work.
    #[error("iterator is terminating")]
    Terminated,

    /// No conflict is outstanding at this seq#.
    #[error("no conflict outstanding at seq# {seq}")]
    UnknownConflict {
        /// The requested seq#.
        seq: SeqNum,
    },

    /// Too many seq#s are tracked above the frontier; retry once it moves.
    #[error("seq# {seq} refused: {tracked} seq#s already tracked above the frontier")]
    AtCapacity {
        /// The refused seq#.
        seq: SeqNum,
        /// Seq#s currently tracked.
        tracked: usize,
    },

    /// Role transition failed.
    #[error(transparent)]
    Role(#[from] RoleError),
}

/// Per-iterator resolution state. Lost on crash by design: recovery re-polls
/// the source from the checkpoint and re-reads the store.
pub struct ResolutionEngine {
    entity: String,
    writer: Arc<dyn DigestStore>,
    reader: Arc<dyn DigestStore>,
    role: RoleMachine,
    timer: FailoverTimer,
    pending: BTreeMap<SeqNum, PendingCandidate>,
    resolved_above: BTreeSet<SeqNum>,
    conflicts: BTreeMap<SeqNum, ConflictReport>,
    max_tracked: usize,
    origin: SeqNum,
    high_water: Option<SeqNum>,
    store_healthy: bool,
    observer: Arc<dyn RuntimeObserver>,
}

impl std::fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field("entity", &self.entity)
            .field("role", &self.role.role())
            .field("high_water", &self.high_water)
            .field("pending", &self.pending.len())
            .field("conflicts", &self.conflicts.len())
            .finish_non_exhaustive()
    }
}

impl ResolutionEngine {
    /// Creates an engine that resolves `entity` starting at `origin`.
    ///
    /// Reads and writes both go to `writer` unless [`Self::with_reader`] is
    /// used.
    #[must_use]
    pub fn new(
        entity: impl Into<String>,
        writer: Arc<dyn DigestStore>,
        role: RoleMachine,
        timer: FailoverTimer,
        origin: SeqNum,
    ) -> Self {
        Self {
            entity: entity.into(),
            reader: Arc::clone(&writer),
            writer,
            role,
            timer,
            pending: BTreeMap::new(),
            resolved_above: BTreeSet::new(),
            conflicts: BTreeMap::new(),
            max_tracked: DEFAULT_MAX_TRACKED,
            origin,
            high_water: origin.checked_sub(1),
            store_healthy: true,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Uses `reader` for support-side reads and confirmation scans.
    #[must_use]
    pub fn with_reader(mut self, reader: Arc<dyn DigestStore>) -> Self {
        self.reader = reader;
        self
    }

    /// Bounds the seq#s tracked above the frontier (at least one).
    #[must_use]
    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked.max(1);
        self
    }

    /// Reports events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RuntimeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The tracked entity.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role.role()
    }

    /// Contiguous resolved frontier.
    #[must_use]
    pub const fn high_water_seq(&self) -> Option<SeqNum> {
        self.high_water
    }

    /// Next seq# the frontier is waiting for.
    #[must_use]
    pub fn next_seq(&self) -> SeqNum {
        self.high_water
            .map_or(self.origin, |seq| seq.saturating_add(1))
    }

    /// Pending candidates in ascending seq# order.
    pub fn pending(&self) -> impl Iterator<Item = &PendingCandidate> {
        self.pending.values()
    }

    /// Seq#s tracked above the frontier: pending candidates plus seq#s
    /// resolved out of order.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.pending.len() + self.resolved_above.len()
    }

    /// Whether new seq#s above the frontier are refused.
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.tracked() >= self.max_tracked
    }

    /// Outstanding conflicts in ascending seq# order.
    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictReport> {
        self.conflicts.values()
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            role: self.role(),
            high_water_seq: self.high_water,
            next_seq: self.next_seq(),
            pending: self.pending.len(),
            conflicts: self.conflicts.values().cloned().collect(),
            store_healthy: self.store_healthy,
        }
    }

    /// Classifies one observation from the source poller.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Terminated`] once the iterator is terminating,
    /// and [`EngineError::AtCapacity`] for a seq# above the frontier while
    /// [`Self::at_capacity`] holds. Store failures are not errors: they leave
    /// the seq# pending.
    pub async fn observe(&mut self, entry: SeqDigestEntry) -> Result<Observation, EngineError> {
        let observation = match self.role() {
            Role::Terminating => return Err(EngineError::Terminated),
            _ if self.is_resolved(entry.seq) => Observation::Stale { seq: entry.seq },
            _ if entry.seq != self.next_seq()
                && !self.pending.contains_key(&entry.seq)
                && self.at_capacity() =>
            {
                return Err(EngineError::AtCapacity {
                    seq: entry.seq,
                    tracked: self.tracked(),
                });
            },
            Role::Leader => self.observe_as_leader(entry).await,
            Role::Support => self.observe_as_support(entry).await,
        };
        debug!(
            entity = %self.entity,
            seq = observation.seq(),
            outcome = observation.outcome(),
            "Observation classified"
        );
        self.observer.observation(&observation);
        Ok(observation)
    }

    async fn observe_as_leader(&mut self, entry: SeqDigestEntry) -> Observation {
        let seq = entry.seq;
        if !self.pending.is_empty() {
            // Keep store order: queue behind the backlog and flush it.
            self.pending.entry(seq).or_insert_with(|| PendingCandidate {
                seq,
                digest: entry.digest,
                first_seen: Instant::now(),
            });
            self.flush_pending().await;
            if self.pending.contains_key(&seq) {
                return Observation::Deferred { seq };
            }
            return self.after_commit(seq);
        }

        match self.commit(&entry).await {
            Ok(outcome) => match outcome {
                InsertOutcome::Inserted => Observation::Written {
                    seq,
                    already_present: false,
                },
                InsertOutcome::AlreadyPresentSame => Observation::Written {
                    seq,
                    already_present: true,
                },
                InsertOutcome::Conflict { .. } => self.after_commit(seq),
            },
            Err(_) => {
                self.pending.insert(
                    seq,
                    PendingCandidate {
                        seq,
                        digest: entry.digest,
                        first_seen: Instant::now(),
                    },
                );
                Observation::Deferred { seq }
            },
        }
    }

    /// Describes a seq# that just left the backlog.
    fn after_commit(&self, seq: SeqNum) -> Observation {
        match self.conflicts.get(&seq) {
            Some(report) => Observation::Conflict(report.clone()),
            None => Observation::Written {
                seq,
                already_present: false,
            },
        }
    }

    async fn observe_as_support(&mut self, entry: SeqDigestEntry) -> Observation {
        let seq = entry.seq;
        match self.reader.get(&self.entity, seq).await {
            Ok(stored) => {
                self.store_healthy = true;
                match stored {
                    Some(stored) if stored == entry.digest => {
                        self.mark_resolved(seq);
                        Observation::Confirmed { seq }
                    },
                    Some(stored) => {
                        self.pending.remove(&seq);
                        Observation::Conflict(self.record_conflict(seq, entry.digest, stored))
                    },
                    None => Observation::Pending {
                        seq,
                        new: self.track_pending(entry),
                        store_reachable: true,
                    },
                }
            },
            Err(err) => {
                self.store_failed("read", seq, &err);
                Observation::Pending {
                    seq,
                    new: self.track_pending(entry),
                    store_reachable: false,
                }
            },
        }
    }

    /// Inserts a candidate unless one exists. Returns whether it was new.
    fn track_pending(&mut self, entry: SeqDigestEntry) -> bool {
        let seq = entry.seq;
        let mut new = false;
        self.pending.entry(seq).or_insert_with(|| {
            new = true;
            PendingCandidate {
                seq,
                digest: entry.digest,
                first_seen: Instant::now(),
            }
        });
        new
    }

    /// Periodic maintenance; see the module docs.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Terminated`] once the iterator is terminating.
    pub async fn sweep(&mut self, now: Instant) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        match self.role() {
            Role::Terminating => return Err(EngineError::Terminated),
            Role::Leader => {
                self.recheck_conflicts(&mut report).await;
                report.committed += self.flush_pending().await;
            },
            Role::Support => {
                self.recheck_conflicts(&mut report).await;
                self.confirm_pending(&mut report).await;
                self.maybe_promote(now, &mut report).await?;
            },
        }
        Ok(report)
    }

    /// Re-reads conflicted seq#s from the writer. Writer rows are immutable,
    /// so only a conflict seen through a lagging or diverged replica can
    /// clear here: once the writer holds the observed digest, the seq# is
    /// resolved. A conflict in the writer itself needs an acknowledgement.
    async fn recheck_conflicts(&mut self, report: &mut SweepReport) {
        let seqs: Vec<SeqNum> = self.conflicts.keys().copied().collect();
        for seq in seqs {
            let stored = match self.writer.get(&self.entity, seq).await {
                Ok(stored) => stored,
                Err(err) => {
                    self.store_failed("conflict re-check", seq, &err);
                    return;
                },
            };
            self.store_healthy = true;
            let Some(conflict) = self.conflicts.get_mut(&seq) else {
                continue;
            };
            match stored {
                Some(stored) if stored == conflict.observed => {
                    info!(entity = %self.entity, seq, digest = %stored, "Conflict cleared, writer holds the observed digest");
                    self.conflicts.remove(&seq);
                    self.mark_resolved(seq);
                    report.conflicts_cleared += 1;
                },
                Some(stored) if stored != conflict.stored => {
                    warn!(entity = %self.entity, seq, stored = %stored, "Conflicting row changed");
                    conflict.stored = stored;
                },
                _ => {},
            }
        }
    }

    /// Confirms pending candidates with a single scan from the lowest one.
    async fn confirm_pending(&mut self, report: &mut SweepReport) {
        let (Some(&lowest), Some(&highest)) =
            (self.pending.keys().next(), self.pending.keys().next_back())
        else {
            return;
        };
        let span = usize::try_from(highest - lowest)
            .map_or(MAX_CONFIRM_SCAN, |span| span.saturating_add(1).min(MAX_CONFIRM_SCAN));

        let entries = match self.reader.scan_from(&self.entity, lowest, span).await {
            Ok(entries) => entries,
            Err(err) => {
                self.store_failed("confirmation scan", lowest, &err);
                return;
            },
        };
        self.store_healthy = true;

        for stored in entries {
            let Some(candidate) = self.pending.get(&stored.seq) else {
                continue;
            };
            if candidate.digest == stored.digest {
                self.mark_resolved(stored.seq);
                report.confirmed += 1;
            } else if let Some(candidate) = self.pending.remove(&stored.seq) {
                self.record_conflict(stored.seq, candidate.digest, stored.digest);
                report.conflicts_found += 1;
            }
        }
    }

    async fn maybe_promote(
        &mut self,
        now: Instant,
        report: &mut SweepReport,
    ) -> Result<(), EngineError> {
        if !self.conflicts.is_empty() {
            return Ok(());
        }
        let candidates = self.pending.values().map(|c| (c.seq, c.first_seen));
        let Some(trigger) = self.timer.select_trigger(candidates, now) else {
            return Ok(());
        };
        let Some(observed) = self.pending.get(&trigger).map(|c| c.digest.clone()) else {
            return Ok(());
        };

        // Only the writer's answer counts: a lagging replica must not cause
        // promotion.
        match self.writer.get(&self.entity, trigger).await {
            Err(err) => {
                self.store_failed("promotion check", trigger, &err);
                return Ok(());
            },
            Ok(Some(stored)) => {
                self.store_healthy = true;
                if stored == observed {
                    self.mark_resolved(trigger);
                    report.confirmed += 1;
                } else {
                    self.pending.remove(&trigger);
                    self.record_conflict(trigger, observed, stored);
                    report.conflicts_found += 1;
                }
                return Ok(());
            },
            Ok(None) => self.store_healthy = true,
        }

        info!(
            entity = %self.entity,
            seq = trigger,
            timeout_ms = u64::try_from(self.timer.timeout().as_millis()).unwrap_or(u64::MAX),
            pending = self.pending.len(),
            "Pending candidate expired unconfirmed, taking over as leader"
        );
        self.role.promote(trigger)?;
        self.observer.promoted(trigger);
        report.promoted = Some(trigger);
        report.committed += self.flush_pending().await;
        Ok(())
    }

    /// Writes every queued candidate in ascending seq# order, stopping at
    /// the first store failure. Returns how many were committed.
    async fn flush_pending(&mut self) -> usize {
        let mut committed = 0;
        while let Some(candidate) = self.pending.values().next().cloned() {
            let entry = SeqDigestEntry::new(candidate.seq, candidate.digest);
            match self.commit(&entry).await {
                Ok(outcome) => {
                    if outcome.is_committed() {
                        committed += 1;
                    }
                },
                Err(_) => break,
            }
        }
        committed
    }

    /// Inserts one entry through the writer and books the outcome. On error
    /// the caller decides whether to keep the entry queued.
    async fn commit(&mut self, entry: &SeqDigestEntry) -> Result<InsertOutcome, StoreError> {
        let outcome = match self.writer.insert_if_absent(&self.entity, entry).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.store_failed("write", entry.seq, &err);
                return Err(err);
            },
        };
        self.store_healthy = true;
        self.pending.remove(&entry.seq);
        match &outcome {
            InsertOutcome::Inserted | InsertOutcome::AlreadyPresentSame => {
                self.mark_resolved(entry.seq);
            },
            InsertOutcome::Conflict { existing } => {
                self.record_conflict(entry.seq, entry.digest.clone(), existing.clone());
            },
        }
        Ok(outcome)
    }

    /// Accepts the stored digest for a conflicted seq#, clearing the hard
    /// stop and letting the frontier move past it.
    ///
    /// # Errors
    ///
    /// Fails if no conflict is outstanding at `seq`, or the iterator is
    /// terminating.
    pub fn acknowledge_conflict(&mut self, seq: SeqNum) -> Result<ConflictReport, EngineError> {
        if self.role().is_terminating() {
            return Err(EngineError::Terminated);
        }
        let report = self
            .conflicts
            .remove(&seq)
            .ok_or(EngineError::UnknownConflict { seq })?;
        info!(
            entity = %self.entity,
            seq,
            accepted = %report.stored,
            rejected = %report.observed,
            "Conflict acknowledged, keeping stored digest"
        );
        self.mark_resolved(seq);
        Ok(report)
    }

    /// Moves to `Terminating` and drops all pending state.
    pub fn terminate(&mut self) -> Role {
        let previous = self.role.terminate();
        if !self.pending.is_empty() {
            debug!(entity = %self.entity, dropped = self.pending.len(), "Dropping pending candidates");
        }
        self.pending.clear();
        previous
    }

    fn is_resolved(&self, seq: SeqNum) -> bool {
        seq < self.next_seq() || self.resolved_above.contains(&seq)
    }

    fn mark_resolved(&mut self, seq: SeqNum) {
        self.pending.remove(&seq);
        let next = self.next_seq();
        if seq < next {
            return;
        }
        if seq > next {
            self.resolved_above.insert(seq);
            return;
        }
        let mut frontier = seq;
        while let Some(following) = frontier.checked_add(1) {
            if !self.resolved_above.remove(&following) {
                break;
            }
            frontier = following;
        }
        self.high_water = Some(frontier);
    }

    fn record_conflict(&mut self, seq: SeqNum, observed: Digest, stored: Digest) -> ConflictReport {
        if let Some(existing) = self.conflicts.get(&seq) {
            if existing.observed == observed && existing.stored == stored {
                return existing.clone();
            }
        }
        warn!(
            entity = %self.entity,
            seq,
            observed = %observed,
            stored = %stored,
            "Digest conflict: store holds a different digest, halting at this seq#"
        );
        let report = ConflictReport {
            seq,
            observed,
            stored,
            detected_at: Utc::now(),
        };
        self.observer.conflict(&report);
        self.conflicts.insert(seq, report.clone());
        report
    }

    fn store_failed(&mut self, op: &'static str, seq: SeqNum, err: &StoreError) {
        if self.store_healthy {
            warn!(entity = %self.entity, seq, op, error = %err, "Digest store operation failed");
        } else {
            debug!(entity = %self.entity, seq, op, error = %err, "Digest store still failing");
        }
        self.store_healthy = false;
        self.observer.store_error(err);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::InMemoryDigestStore;

    const X: Duration = Duration::from_secs(2);

    fn engine(store: &Arc<InMemoryDigestStore>, role: Role, origin: SeqNum) -> ResolutionEngine {
        ResolutionEngine::new(
            "sender",
            Arc::clone(store) as Arc<dyn DigestStore>,
            RoleMachine::new(role).unwrap(),
            FailoverTimer::new(X),
            origin,
        )
    }

    fn entry(seq: SeqNum) -> SeqDigestEntry {
        SeqDigestEntry::new(seq, format!("d{seq}").as_str())
    }

    #[tokio::test]
    async fn leader_writes_and_advances() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut leader = engine(&store, Role::Leader, 1);
        assert_eq!(leader.high_water_seq(), Some(0));

        for seq in 1..=10 {
            let obs = leader.observe(entry(seq)).await.unwrap();
            assert_eq!(
                obs,
                Observation::Written {
                    seq,
                    already_present: false
                }
            );
        }
        assert_eq!(leader.high_water_seq(), Some(10));
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn frontier_is_none_until_origin_zero_resolves() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut leader = engine(&store, Role::Leader, 0);
        assert_eq!(leader.high_water_seq(), None);
        assert_eq!(leader.next_seq(), 0);
        leader.observe(entry(0)).await.unwrap();
        assert_eq!(leader.high_water_seq(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn support_confirms_matching_and_tracks_missing() {
        let store = Arc::new(InMemoryDigestStore::new());
        store.insert_if_absent("sender", &entry(5)).await.unwrap();
        let mut support = engine(&store, Role::Support, 5);

        assert_eq!(
            support.observe(entry(5)).await.unwrap(),
            Observation::Confirmed { seq: 5 }
        );
        assert_eq!(support.high_water_seq(), Some(5));

        let first = support.observe(entry(6)).await.unwrap();
        assert_eq!(
            first,
            Observation::Pending {
                seq: 6,
                new: true,
                store_reachable: true
            }
        );
        let seen = support.pending().next().unwrap().first_seen;

        tokio::time::advance(Duration::from_millis(500)).await;
        let again = support.observe(entry(6)).await.unwrap();
        assert!(matches!(again, Observation::Pending { new: false, .. }));
        assert_eq!(support.pending().next().unwrap().first_seen, seen);
        assert_eq!(support.high_water_seq(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn support_promotes_after_timeout_and_commits_pending_in_order() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut support = engine(&store, Role::Support, 11);

        support.observe(entry(11)).await.unwrap();
        support.observe(entry(12)).await.unwrap();

        tokio::time::advance(X - Duration::from_millis(1)).await;
        let early = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(early.promoted, None);
        assert_eq!(support.role(), Role::Support);

        tokio::time::advance(Duration::from_millis(1)).await;
        let report = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(report.promoted, Some(11));
        assert_eq!(report.committed, 2);
        assert_eq!(support.role(), Role::Leader);
        assert_eq!(support.high_water_seq(), Some(12));
        assert_eq!(support.pending().count(), 0);
        assert_eq!(store.get("sender", 12).await.unwrap(), Some(entry(12).digest));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_confirms_pending_written_by_someone_else() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut support = engine(&store, Role::Support, 1);
        for seq in 1..=3 {
            support.observe(entry(seq)).await.unwrap();
        }

        store.insert_if_absent("sender", &entry(1)).await.unwrap();
        store.insert_if_absent("sender", &entry(3)).await.unwrap();

        let report = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(report.confirmed, 2);
        assert_eq!(support.high_water_seq(), Some(1));
        assert_eq!(support.pending().map(|c| c.seq).collect::<Vec<_>>(), vec![2]);

        store.insert_if_absent("sender", &entry(2)).await.unwrap();
        support.sweep(Instant::now()).await.unwrap();
        assert_eq!(support.high_water_seq(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_halts_frontier_and_blocks_promotion() {
        let store = Arc::new(InMemoryDigestStore::new());
        store
            .insert_if_absent("sender", &SeqDigestEntry::new(20, "dY"))
            .await
            .unwrap();
        let mut support = engine(&store, Role::Support, 20);

        let obs = support
            .observe(SeqDigestEntry::new(20, "dX"))
            .await
            .unwrap();
        let Observation::Conflict(report) = obs else {
            panic!("expected a conflict, got {obs:?}");
        };
        assert_eq!(report.stored, Digest::from("dY"));
        assert_eq!(store.get("sender", 20).await.unwrap(), Some(Digest::from("dY")));

        support.observe(entry(21)).await.unwrap();
        tokio::time::advance(X * 3).await;
        let sweep = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(sweep.promoted, None);
        assert_eq!(support.role(), Role::Support);
        assert_eq!(support.high_water_seq(), Some(19));

        let acked = support.acknowledge_conflict(20).unwrap();
        assert_eq!(acked.observed, Digest::from("dX"));
        assert_eq!(support.high_water_seq(), Some(20));
        assert!(matches!(
            support.acknowledge_conflict(20),
            Err(EngineError::UnknownConflict { seq: 20 })
        ));

        let sweep = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(sweep.promoted, Some(21));
        assert_eq!(support.high_water_seq(), Some(21));
    }

    #[tokio::test]
    async fn replica_conflict_clears_when_writer_holds_observed_digest() {
        let writer = Arc::new(InMemoryDigestStore::new());
        let replica = Arc::new(InMemoryDigestStore::new());
        writer.insert_if_absent("sender", &entry(1)).await.unwrap();
        replica
            .insert_if_absent("sender", &SeqDigestEntry::new(1, "other"))
            .await
            .unwrap();
        let mut support = engine(&writer, Role::Support, 1)
            .with_reader(Arc::clone(&replica) as Arc<dyn DigestStore>);

        let obs = support.observe(entry(1)).await.unwrap();
        assert_eq!(obs.outcome(), "conflict");
        assert_eq!(support.high_water_seq(), Some(0));

        let sweep = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(sweep.conflicts_cleared, 1);
        assert_eq!(support.conflicts().count(), 0);
        assert_eq!(support.high_water_seq(), Some(1));
    }

    #[tokio::test]
    async fn writer_conflict_survives_recheck() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut leader = engine(&store, Role::Leader, 1);
        store
            .insert_if_absent("sender", &SeqDigestEntry::new(1, "other"))
            .await
            .unwrap();

        assert_eq!(leader.observe(entry(1)).await.unwrap().outcome(), "conflict");
        leader.observe(entry(2)).await.unwrap();

        let sweep = leader.sweep(Instant::now()).await.unwrap();
        assert_eq!(sweep.conflicts_cleared, 0);
        assert_eq!(leader.conflicts().count(), 1);
        assert_eq!(leader.high_water_seq(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_is_bounded_while_a_conflict_is_outstanding() {
        let store = Arc::new(InMemoryDigestStore::new());
        store
            .insert_if_absent("sender", &SeqDigestEntry::new(1, "other"))
            .await
            .unwrap();
        for seq in 2..=5 {
            store.insert_if_absent("sender", &entry(seq)).await.unwrap();
        }
        let mut support = engine(&store, Role::Support, 1).with_max_tracked(8);

        assert_eq!(support.observe(entry(1)).await.unwrap().outcome(), "conflict");
        let mut refused = 0;
        for seq in 2..=200 {
            match support.observe(entry(seq)).await {
                Ok(_) => {},
                Err(EngineError::AtCapacity { seq: at, tracked }) => {
                    assert_eq!(at, seq);
                    assert_eq!(tracked, 8);
                    refused += 1;
                },
                Err(err) => panic!("unexpected error {err}"),
            }
            assert!(support.tracked() <= 8);
        }
        assert_eq!(refused, 199 - 8);
        assert!(support.at_capacity());
        assert_eq!(support.pending().count(), 4);

        tokio::time::advance(X * 3).await;
        assert_eq!(support.sweep(Instant::now()).await.unwrap().promoted, None);
        assert!(support.tracked() <= 8);

        // Clearing the hard stop drains the resolved seq#s into the frontier.
        support.acknowledge_conflict(1).unwrap();
        assert_eq!(support.high_water_seq(), Some(5));
        assert_eq!(support.tracked(), 4);
        assert!(!support.at_capacity());
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_keeps_candidates_pending_without_promotion() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut support = engine(&store, Role::Support, 1);
        store.set_available(false);

        let obs = support.observe(entry(1)).await.unwrap();
        assert_eq!(
            obs,
            Observation::Pending {
                seq: 1,
                new: true,
                store_reachable: false
            }
        );
        tokio::time::advance(X * 2).await;
        let sweep = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(sweep.promoted, None);
        assert!(!support.snapshot().store_healthy);

        // Once the store is back and still has nothing, the expired
        // candidate promotes.
        store.set_available(true);
        let sweep = support.sweep(Instant::now()).await.unwrap();
        assert_eq!(sweep.promoted, Some(1));
        assert!(support.snapshot().store_healthy);
    }

    #[tokio::test]
    async fn leader_queues_writes_while_store_is_down() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut leader = engine(&store, Role::Leader, 1);
        store.set_available(false);

        assert_eq!(
            leader.observe(entry(1)).await.unwrap(),
            Observation::Deferred { seq: 1 }
        );
        assert_eq!(
            leader.observe(entry(2)).await.unwrap(),
            Observation::Deferred { seq: 2 }
        );

        store.set_available(true);
        let obs = leader.observe(entry(3)).await.unwrap();
        assert_eq!(obs.outcome(), "written");
        assert_eq!(leader.high_water_seq(), Some(3));
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn resumed_iterator_ignores_seqs_below_checkpoint() {
        let store = Arc::new(InMemoryDigestStore::new());
        store
            .insert_if_absent("sender", &SeqDigestEntry::new(4, "old"))
            .await
            .unwrap();
        let mut support = engine(&store, Role::Support, 11);
        store.set_available(false);

        // No store call is made, so unavailability does not matter.
        let obs = support.observe(entry(4)).await.unwrap();
        assert_eq!(obs, Observation::Stale { seq: 4 });
        assert_eq!(support.conflicts().count(), 0);
    }

    #[tokio::test]
    async fn terminated_engine_rejects_work() {
        let store = Arc::new(InMemoryDigestStore::new());
        let mut support = engine(&store, Role::Support, 1);
        support.observe(entry(1)).await.unwrap();

        assert_eq!(support.terminate(), Role::Support);
        assert_eq!(support.pending().count(), 0);
        assert!(matches!(
            support.observe(entry(2)).await,
            Err(EngineError::Terminated)
        ));
        assert!(matches!(
            support.sweep(Instant::now()).await,
            Err(EngineError::Terminated)
        ));
    }
}
