//! Supervisor loop.
//!
//! Runs on its own cadence, independent of any iterator. Every cycle it:
//!
//! 1. polls every iterator's status (unreachable iterators are skipped),
//! 2. records a checkpoint per live iterator, floored at the slowest live
//!    observer when [`CheckpointFloor::Fleet`] is configured,
//! 3. keeps exactly one leader if several report `Leader` and terminates the
//!    rest.
//!
//! Every step is safe to repeat: checkpoints never move backwards and
//! terminating an already-terminated iterator is a no-op on its side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, CheckpointWrite};
use crate::observer::{NoopObserver, SupervisorObserver};
use crate::status::{Health, IteratorStatus};
use crate::types::{IteratorId, SeqNum};

/// Errors from the supervisor-to-iterator control surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The iterator could not be reached.
    #[error("iterator unreachable: {0}")]
    Unreachable(String),

    /// The iterator did not answer in time.
    #[error("iterator did not answer within {0:?}")]
    Timeout(Duration),

    /// The iterator answered with an error status.
    #[error("iterator rejected request with status {status}: {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The answer could not be decoded.
    #[error("malformed iterator response: {0}")]
    Malformed(String),
}

/// Out-of-band control of one iterator process.
#[async_trait]
pub trait IteratorControl: Send + Sync {
    /// The iterator this handle controls.
    fn id(&self) -> &IteratorId;

    /// Fetches the iterator's current status.
    async fn status(&self) -> Result<IteratorStatus, ControlError>;

    /// Asks the iterator to terminate. Must be harmless when repeated.
    async fn terminate(&self) -> Result<(), ControlError>;
}

/// Which of several concurrent leaders survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Highest high-water seq#; equal frontiers go to the lowest id.
    #[default]
    HighestHighWater,
    /// Lowest id.
    LowestId,
}

/// How a checkpoint seq# is derived from a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFloor {
    /// Never past the lowest high-water seq# among live iterators.
    #[default]
    Fleet,
    /// The iterator's own high-water seq#.
    Own,
}

/// Supervisor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Time between cycles.
    pub interval: Duration,
    /// Per-iterator status poll timeout.
    pub status_timeout: Duration,
    /// Leader tie-break rule.
    pub tie_break: TieBreak,
    /// Checkpoint derivation rule.
    pub checkpoint_floor: CheckpointFloor,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            status_timeout: Duration::from_secs(1),
            tie_break: TieBreak::default(),
            checkpoint_floor: CheckpointFloor::default(),
        }
    }
}

/// Result of polling one iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledIterator {
    /// Polled iterator.
    pub id: IteratorId,
    /// Its status, `None` if it could not be reached.
    pub status: Option<IteratorStatus>,
}

impl PolledIterator {
    /// Health as seen by the supervisor.
    #[must_use]
    pub fn health(&self) -> Health {
        self.status
            .as_ref()
            .map_or(Health::Unreachable, IteratorStatus::health)
    }

    /// Reachable and not shutting down.
    fn live_status(&self) -> Option<&IteratorStatus> {
        self.status
            .as_ref()
            .filter(|status| !status.role.is_terminating())
    }
}

/// Statuses of all iterators from one cycle. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    /// One entry per configured iterator, in configuration order.
    pub iterators: Vec<PolledIterator>,
    /// When the poll completed.
    pub taken_at: DateTime<Utc>,
}

impl SupervisorSnapshot {
    /// Builds a snapshot stamped now.
    #[must_use]
    pub fn new(iterators: Vec<PolledIterator>) -> Self {
        Self {
            iterators,
            taken_at: Utc::now(),
        }
    }

    /// Reachable iterators reporting `Leader`.
    pub fn leaders(&self) -> impl Iterator<Item = &IteratorStatus> {
        self.iterators
            .iter()
            .filter_map(|polled| polled.status.as_ref())
            .filter(|status| status.role.is_leader())
    }

    /// Iterators whose status could not be fetched.
    pub fn unreachable(&self) -> impl Iterator<Item = &IteratorId> {
        self.iterators
            .iter()
            .filter(|polled| polled.status.is_none())
            .map(|polled| &polled.id)
    }

    /// The leader that stays when several report `Leader`.
    #[must_use]
    pub fn select_survivor(&self, tie_break: TieBreak) -> Option<&IteratorStatus> {
        match tie_break {
            TieBreak::HighestHighWater => self.leaders().max_by(|a, b| {
                a.high_water_seq
                    .cmp(&b.high_water_seq)
                    .then_with(|| b.id.cmp(&a.id))
            }),
            TieBreak::LowestId => self.leaders().min_by(|a, b| a.id.cmp(&b.id)),
        }
    }

    /// Leaders to terminate: every leader except the survivor.
    #[must_use]
    pub fn redundant_leaders(&self, tie_break: TieBreak) -> Vec<IteratorId> {
        let Some(survivor) = self.select_survivor(tie_break) else {
            return Vec::new();
        };
        self.leaders()
            .filter(|status| status.id != survivor.id)
            .map(|status| status.id.clone())
            .collect()
    }

    /// Lowest high-water seq# among live iterators that have resolved
    /// anything.
    #[must_use]
    pub fn fleet_floor(&self) -> Option<SeqNum> {
        self.iterators
            .iter()
            .filter_map(PolledIterator::live_status)
            .filter_map(|status| status.high_water_seq)
            .min()
    }

    /// Checkpoints to record this cycle, one per live iterator that has a
    /// high-water seq#.
    #[must_use]
    pub fn checkpoint_plan(&self, floor: CheckpointFloor) -> Vec<Checkpoint> {
        let fleet = match floor {
            CheckpointFloor::Fleet => self.fleet_floor(),
            CheckpointFloor::Own => None,
        };
        self.iterators
            .iter()
            .filter_map(PolledIterator::live_status)
            .filter_map(|status| {
                let own = status.high_water_seq?;
                let seq = fleet.map_or(own, |fleet| own.min(fleet));
                Some(Checkpoint {
                    iterator_id: status.id.clone(),
                    seq,
                    recorded_at: self.taken_at,
                })
            })
            .collect()
    }
}

/// What one supervisor cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Iterators polled.
    pub polled: usize,
    /// Iterators that did not answer.
    pub unreachable: Vec<IteratorId>,
    /// Iterators reporting `Leader` before termination.
    pub leaders: Vec<IteratorId>,
    /// The leader kept, if any leader was seen.
    pub survivor: Option<IteratorId>,
    /// Leaders that acknowledged termination.
    pub terminated: Vec<IteratorId>,
    /// Leaders whose termination request failed; retried next cycle.
    pub terminate_failures: Vec<IteratorId>,
    /// Checkpoint writes attempted, with their results.
    pub checkpoints: Vec<(IteratorId, SeqNum, CheckpointWrite)>,
    /// Checkpoint writes that failed.
    pub checkpoint_failures: usize,
}

/// Single-leader enforcement and checkpointing across a fleet of iterators.
pub struct Supervisor {
    controls: Vec<Arc<dyn IteratorControl>>,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: SupervisorSettings,
    observer: Arc<dyn SupervisorObserver>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field(
                "iterators",
                &self.controls.iter().map(|c| c.id().clone()).collect::<Vec<_>>(),
            )
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor over `controls`.
    #[must_use]
    pub fn new(
        controls: Vec<Arc<dyn IteratorControl>>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            controls,
            checkpoints,
            settings,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Reports cycles to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SupervisorObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Polls every iterator concurrently, each bounded by the status timeout.
    pub async fn poll(&self) -> SupervisorSnapshot {
        let timeout = self.settings.status_timeout;
        let polls = self.controls.iter().map(|control| async move {
            let status = match tokio::time::timeout(timeout, control.status()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(err)) => {
                    debug!(iterator_id = %control.id(), error = %err, "Status poll failed");
                    None
                },
                Err(_) => {
                    debug!(iterator_id = %control.id(), ?timeout, "Status poll timed out");
                    None
                },
            };
            PolledIterator {
                id: control.id().clone(),
                status,
            }
        });
        SupervisorSnapshot::new(join_all(polls).await)
    }

    /// Runs one full cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let snapshot = self.poll().await;
        let mut report = CycleReport {
            polled: snapshot.iterators.len(),
            unreachable: snapshot.unreachable().cloned().collect(),
            leaders: snapshot.leaders().map(|s| s.id.clone()).collect(),
            survivor: snapshot
                .select_survivor(self.settings.tie_break)
                .map(|s| s.id.clone()),
            ..CycleReport::default()
        };
        if !report.unreachable.is_empty() {
            warn!(unreachable = ?report.unreachable, "Some iterators did not answer");
        }

        for checkpoint in snapshot.checkpoint_plan(self.settings.checkpoint_floor) {
            match self.checkpoints.record(&checkpoint).await {
                Ok(write) => {
                    if let CheckpointWrite::Advanced { previous } = write {
                        debug!(
                            iterator_id = %checkpoint.iterator_id,
                            seq = checkpoint.seq,
                            ?previous,
                            "Checkpoint advanced"
                        );
                    }
                    report
                        .checkpoints
                        .push((checkpoint.iterator_id, checkpoint.seq, write));
                },
                Err(err) => {
                    warn!(iterator_id = %checkpoint.iterator_id, error = %err, "Failed to record checkpoint");
                    report.checkpoint_failures += 1;
                },
            }
        }

        let redundant = snapshot.redundant_leaders(self.settings.tie_break);
        if !redundant.is_empty() {
            info!(
                survivor = ?report.survivor,
                redundant = ?redundant,
                tie_break = ?self.settings.tie_break,
                "Multiple leaders detected, terminating redundant ones"
            );
        }
        let terminations = redundant.into_iter().filter_map(|id| {
            let control = self.controls.iter().find(|c| *c.id() == id)?;
            Some(async move { (id, control.terminate().await) })
        });
        for (id, result) in join_all(terminations).await {
            match result {
                Ok(()) => report.terminated.push(id),
                Err(err) => {
                    warn!(iterator_id = %id, error = %err, "Terminate request failed, will retry next cycle");
                    report.terminate_failures.push(id);
                },
            }
        }

        self.observer.cycle(&report);
        report
    }

    /// Runs cycles every interval until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            iterators = self.controls.len(),
            interval = ?self.settings.interval,
            "Supervisor started"
        );
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.run_cycle().await;
                },
            }
        }
        info!("Supervisor stopped");
    }
}
