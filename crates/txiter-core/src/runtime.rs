//! Iterator runtime.
//!
//! Wires one [`SourcePoller`] to one [`ResolutionEngine`]:
//!
//! - the poller runs in its own task and feeds a bounded channel, so a slow
//!   upstream call never delays the failover sweep;
//! - the resolver loop multiplexes control commands, sweep ticks and
//!   observations, in that priority order, so a backlog of observations
//!   never starves the failover sweep;
//! - observations are not taken off the channel while the engine is at
//!   capacity, which pushes back on the poller until the frontier moves;
//! - every change is published as an [`IteratorStatus`] on a watch channel.
//!
//! A [`RuntimeHandle`] is the in-process control surface: the HTTP server
//! and signal handlers use it, and it implements [`IteratorControl`] so a
//! supervisor can drive in-process iterators directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::observer::{NoopObserver, RuntimeObserver};
use crate::resolution::{ConflictReport, EngineError, ResolutionEngine};
use crate::source::{SourcePoller, UpstreamSource};
use crate::status::{IteratorIdentity, IteratorStatus};
use crate::supervisor::{ControlError, IteratorControl};
use crate::types::{IteratorId, SeqNum};

const COMMAND_CAPACITY: usize = 16;

/// Runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The runtime loop has exited.
    #[error("iterator runtime has stopped")]
    Stopped,

    /// The poller task ended unexpectedly.
    #[error("source poller task stopped unexpectedly")]
    PollerStopped,

    /// The engine rejected a command.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The resume checkpoint could not be loaded.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Why the runtime loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A terminate command was received.
    Terminated,
    /// Every handle was dropped.
    HandlesDropped,
}

/// Commands accepted by the runtime loop.
#[derive(Debug)]
pub enum ControlCommand {
    /// Move to `Terminating` and exit.
    Terminate,
    /// Accept the stored digest for a conflicted seq#.
    AcknowledgeConflict {
        /// Conflicted seq#.
        seq: SeqNum,
        /// Receives the cleared report.
        reply: oneshot::Sender<Result<ConflictReport, EngineError>>,
    },
}

/// Loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// Buffer between poller and resolver.
    pub channel_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(250),
            channel_capacity: 1024,
        }
    }
}

/// Where a (re)started iterator begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    /// First seq# to fetch.
    pub seq: SeqNum,
    /// Whether it came from a checkpoint.
    pub from_checkpoint: bool,
}

/// Loads the iterator's checkpoint and returns the seq# after it, or
/// `start_seq` if none was ever recorded.
///
/// # Errors
///
/// Returns an error if the checkpoint store cannot be read.
pub async fn resume_point(
    checkpoints: &dyn CheckpointStore,
    id: &IteratorId,
    start_seq: SeqNum,
) -> Result<ResumePoint, RuntimeError> {
    let point = match checkpoints.load(id).await? {
        Some(checkpoint) => {
            info!(
                iterator_id = %id,
                checkpoint = checkpoint.seq,
                recorded_at = %checkpoint.recorded_at,
                "Resuming from checkpoint"
            );
            ResumePoint {
                seq: checkpoint.resume_seq(),
                from_checkpoint: true,
            }
        },
        None => {
            info!(iterator_id = %id, start_seq, "No checkpoint, starting from configured origin");
            ResumePoint {
                seq: start_seq,
                from_checkpoint: false,
            }
        },
    };
    Ok(point)
}

/// One iterator process: poller task plus resolver loop.
pub struct IteratorRuntime<S: ?Sized> {
    identity: IteratorIdentity,
    engine: ResolutionEngine,
    poller: SourcePoller<S>,
    settings: RuntimeSettings,
    commands: mpsc::Receiver<ControlCommand>,
    handle: RuntimeHandle,
    status_tx: watch::Sender<IteratorStatus>,
    started_at: chrono::DateTime<Utc>,
    observer: Arc<dyn RuntimeObserver>,
}

impl<S> IteratorRuntime<S>
where
    S: UpstreamSource + ?Sized + 'static,
{
    /// Assembles a runtime. The poller should start at the engine's origin.
    #[must_use]
    pub fn new(
        identity: IteratorIdentity,
        engine: ResolutionEngine,
        poller: SourcePoller<S>,
        settings: RuntimeSettings,
    ) -> Self {
        let started_at = Utc::now();
        let initial = IteratorStatus::from_snapshot(&identity, engine.snapshot(), started_at);
        let (status_tx, status_rx) = watch::channel(initial);
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let handle = RuntimeHandle {
            id: identity.id.clone(),
            commands: command_tx,
            status: status_rx,
        };
        Self {
            identity,
            engine,
            poller,
            settings,
            commands,
            handle,
            status_tx,
            started_at,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Reports published statuses to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RuntimeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// A control handle. Clone it freely.
    #[must_use]
    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Runs until terminated.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PollerStopped`] if the poller task dies.
    pub async fn run(self) -> Result<ExitReason, RuntimeError> {
        let Self {
            identity,
            mut engine,
            mut poller,
            settings,
            mut commands,
            handle,
            status_tx,
            started_at,
            observer,
        } = self;
        // The loop must notice when every external handle is gone.
        drop(handle);

        let publish = |engine: &ResolutionEngine| {
            let status = IteratorStatus::from_snapshot(&identity, engine.snapshot(), started_at);
            observer.status(&status);
            status_tx.send_replace(status);
        };

        info!(
            iterator_id = %identity.id,
            region = %identity.region,
            upstream = %identity.upstream_node,
            role = %engine.role(),
            next_seq = poller.next_seq(),
            "Iterator runtime started"
        );
        publish(&engine);

        let (entry_tx, mut entries) = mpsc::channel(settings.channel_capacity.max(1));
        let poll_task = tokio::spawn(async move {
            loop {
                let entry = poller.next().await;
                if entry_tx.send(entry).await.is_err() {
                    break;
                }
            }
        });

        let mut sweep = tokio::time::interval(settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut throttled = false;
        let result = loop {
            if engine.at_capacity() != throttled {
                throttled = !throttled;
                if throttled {
                    warn!(
                        iterator_id = %identity.id,
                        tracked = engine.tracked(),
                        next_seq = engine.next_seq(),
                        "Tracking limit reached, pausing observations until the frontier moves"
                    );
                } else {
                    info!(iterator_id = %identity.id, "Resuming observations");
                }
            }

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(ControlCommand::Terminate) => break Ok(ExitReason::Terminated),
                    Some(ControlCommand::AcknowledgeConflict { seq, reply }) => {
                        let result = engine.acknowledge_conflict(seq);
                        if let Err(err) = &result {
                            debug!(seq, error = %err, "Conflict acknowledgement rejected");
                        }
                        let _ = reply.send(result);
                        publish(&engine);
                    },
                    None => break Ok(ExitReason::HandlesDropped),
                },
                _ = sweep.tick() => {
                    match engine.sweep(Instant::now()).await {
                        Ok(report) => {
                            if report.promoted.is_some() || report.confirmed > 0
                                || report.committed > 0 || report.conflicts_cleared > 0
                            {
                                debug!(?report, "Sweep made progress");
                            }
                            publish(&engine);
                        },
                        Err(EngineError::Terminated) => break Ok(ExitReason::Terminated),
                        Err(err) => warn!(error = %err, "Sweep failed"),
                    }
                },
                entry = entries.recv(), if !throttled => {
                    let Some(entry) = entry else {
                        break Err(RuntimeError::PollerStopped);
                    };
                    match engine.observe(entry).await {
                        Ok(_) => publish(&engine),
                        Err(EngineError::Terminated) => break Ok(ExitReason::Terminated),
                        Err(err) => warn!(error = %err, "Observation failed"),
                    }
                },
            }
        };

        poll_task.abort();
        engine.terminate();
        publish(&engine);
        info!(
            iterator_id = %identity.id,
            high_water_seq = ?engine.high_water_seq(),
            ?result,
            "Iterator runtime stopped"
        );
        result
    }
}

/// In-process control surface of a running iterator.
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    id: IteratorId,
    commands: mpsc::Sender<ControlCommand>,
    status: watch::Receiver<IteratorStatus>,
}

impl RuntimeHandle {
    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> IteratorStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<IteratorStatus> {
        self.status.clone()
    }

    /// Asks the runtime to terminate. A runtime that already stopped
    /// counts as terminated.
    pub async fn terminate(&self) {
        if self.commands.send(ControlCommand::Terminate).await.is_err() {
            debug!(iterator_id = %self.id, "Terminate sent to a stopped runtime");
        }
    }

    /// Accepts the stored digest for a conflicted seq#.
    ///
    /// # Errors
    ///
    /// Fails if the runtime stopped or no conflict is outstanding at `seq`.
    pub async fn acknowledge_conflict(&self, seq: SeqNum) -> Result<ConflictReport, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ControlCommand::AcknowledgeConflict { seq, reply })
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        Ok(response.await.map_err(|_| RuntimeError::Stopped)??)
    }
}

#[async_trait]
impl IteratorControl for RuntimeHandle {
    fn id(&self) -> &IteratorId {
        &self.id
    }

    async fn status(&self) -> Result<IteratorStatus, ControlError> {
        Ok(Self::status(self))
    }

    async fn terminate(&self) -> Result<(), ControlError> {
        Self::terminate(self).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, InMemoryCheckpointStore};
    use crate::failover::FailoverTimer;
    use crate::role::{Role, RoleMachine};
    use crate::source::{FetchOutcome, PollerConfig, SourceError};
    use crate::store::{DigestStore, InMemoryDigestStore, InsertOutcome, StoreError};
    use crate::types::{Digest, SeqDigestEntry};

    /// Serves `d<seq>` for every seq# below `tail`.
    struct CountingSource {
        tail: SeqNum,
    }

    #[async_trait]
    impl UpstreamSource for CountingSource {
        fn node(&self) -> &str {
            "counting"
        }

        async fn fetch_at(&self, seq: SeqNum) -> Result<FetchOutcome, SourceError> {
            if seq < self.tail {
                Ok(FetchOutcome::Digest(Digest::from(format!("d{seq}").as_str())))
            } else {
                Ok(FetchOutcome::NotYetAvailable)
            }
        }
    }

    /// Delays every call by one millisecond.
    struct SlowStore(InMemoryDigestStore);

    #[async_trait]
    impl DigestStore for SlowStore {
        async fn insert_if_absent(
            &self,
            entity: &str,
            entry: &SeqDigestEntry,
        ) -> Result<InsertOutcome, StoreError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0.insert_if_absent(entity, entry).await
        }

        async fn get(&self, entity: &str, seq: SeqNum) -> Result<Option<Digest>, StoreError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0.get(entity, seq).await
        }

        async fn scan_from(
            &self,
            entity: &str,
            from: SeqNum,
            limit: usize,
        ) -> Result<Vec<SeqDigestEntry>, StoreError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.0.scan_from(entity, from, limit).await
        }
    }

    struct Setup {
        role: Role,
        origin: SeqNum,
        tail: SeqNum,
        failover_timeout: Duration,
        max_tracked: usize,
        settings: RuntimeSettings,
    }

    impl Setup {
        fn new(role: Role, origin: SeqNum, tail: SeqNum) -> Self {
            Self {
                role,
                origin,
                tail,
                failover_timeout: Duration::from_secs(2),
                max_tracked: crate::resolution::DEFAULT_MAX_TRACKED,
                settings: RuntimeSettings {
                    sweep_interval: Duration::from_millis(100),
                    channel_capacity: 8,
                },
            }
        }

        fn build(self, store: Arc<dyn DigestStore>) -> IteratorRuntime<CountingSource> {
            let identity = IteratorIdentity {
                id: "it-test".into(),
                region: "local".into(),
                upstream_node: "counting".into(),
            };
            let engine = ResolutionEngine::new(
                "sender",
                store,
                RoleMachine::new(self.role).unwrap(),
                FailoverTimer::new(self.failover_timeout),
                self.origin,
            )
            .with_max_tracked(self.max_tracked);
            let poller = SourcePoller::new(
                Arc::new(CountingSource { tail: self.tail }),
                PollerConfig::default(),
                self.origin,
            );
            IteratorRuntime::new(identity, engine, poller, self.settings)
        }
    }

    fn runtime(
        store: &Arc<InMemoryDigestStore>,
        role: Role,
        origin: SeqNum,
        tail: SeqNum,
    ) -> IteratorRuntime<CountingSource> {
        Setup::new(role, origin, tail).build(Arc::clone(store) as Arc<dyn DigestStore>)
    }

    async fn wait_for<F>(handle: &RuntimeHandle, mut done: F) -> IteratorStatus
    where
        F: FnMut(&IteratorStatus) -> bool,
    {
        let mut rx = handle.subscribe();
        let status = rx.wait_for(|status| done(status)).await.unwrap();
        status.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn leader_commits_everything_it_sees() {
        let store = Arc::new(InMemoryDigestStore::new());
        let rt = runtime(&store, Role::Leader, 1, 11);
        let handle = rt.handle();
        let task = tokio::spawn(rt.run());

        let status = wait_for(&handle, |s| s.high_water_seq == Some(10)).await;
        assert_eq!(status.role, Role::Leader);
        assert_eq!(store.len(), 10);

        handle.terminate().await;
        assert_eq!(task.await.unwrap().unwrap(), ExitReason::Terminated);
        assert_eq!(handle.status().role, Role::Terminating);
    }

    #[tokio::test(start_paused = true)]
    async fn support_promotes_when_store_stays_empty() {
        let store = Arc::new(InMemoryDigestStore::new());
        let rt = runtime(&store, Role::Support, 11, 12);
        let handle = rt.handle();
        let task = tokio::spawn(rt.run());

        let pending = wait_for(&handle, |s| s.pending == 1).await;
        assert_eq!(pending.role, Role::Support);

        let promoted = wait_for(&handle, |s| s.role == Role::Leader).await;
        assert_eq!(promoted.high_water_seq, Some(11));
        assert_eq!(store.get("sender", 11).await.unwrap(), Some(Digest::from("d11")));

        handle.terminate().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledge_conflict_through_the_handle() {
        let store = Arc::new(InMemoryDigestStore::new());
        store
            .insert_if_absent("sender", &SeqDigestEntry::new(1, "other"))
            .await
            .unwrap();
        let rt = runtime(&store, Role::Support, 1, 2);
        let handle = rt.handle();
        let task = tokio::spawn(rt.run());

        let conflicted = wait_for(&handle, |s| !s.conflicts.is_empty()).await;
        assert_eq!(conflicted.conflicts[0].seq, 1);
        assert_eq!(conflicted.high_water_seq, Some(0));

        assert!(handle.acknowledge_conflict(7).await.is_err());
        let report = handle.acknowledge_conflict(1).await.unwrap();
        assert_eq!(report.stored, Digest::from("other"));
        let cleared = wait_for(&handle, |s| s.conflicts.is_empty()).await;
        assert_eq!(cleared.high_water_seq, Some(1));

        drop(handle);
        assert_eq!(task.await.unwrap().unwrap(), ExitReason::HandlesDropped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn support_promotes_while_catching_up_a_backlog() {
        let store = Arc::new(SlowStore(InMemoryDigestStore::new()));
        let mut setup = Setup::new(Role::Support, 0, 200_000);
        setup.failover_timeout = Duration::from_millis(100);
        setup.settings = RuntimeSettings {
            sweep_interval: Duration::from_millis(20),
            channel_capacity: 1024,
        };
        let rt = setup.build(Arc::clone(&store) as Arc<dyn DigestStore>);
        let handle = rt.handle();
        let task = tokio::spawn(rt.run());

        let promoted = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for(&handle, |s| s.role == Role::Leader),
        )
        .await
        .expect("support never promoted while observations kept arriving");
        assert!(promoted.next_seq < 200_000);
        assert_eq!(store.0.get("sender", 0).await.unwrap(), Some(Digest::from("d0")));

        handle.terminate().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_pauses_observations_at_the_tracking_limit() {
        let store = Arc::new(InMemoryDigestStore::new());
        store
            .insert_if_absent("sender", &SeqDigestEntry::new(1, "other"))
            .await
            .unwrap();
        let mut setup = Setup::new(Role::Support, 1, 10_000);
        setup.max_tracked = 16;
        let rt = setup.build(Arc::clone(&store) as Arc<dyn DigestStore>);
        let handle = rt.handle();
        let task = tokio::spawn(rt.run());

        wait_for(&handle, |s| !s.conflicts.is_empty() && s.pending == 16).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let stalled = handle.status();
        assert_eq!(stalled.role, Role::Support);
        assert_eq!(stalled.pending, 16);
        assert_eq!(stalled.high_water_seq, Some(0));

        handle.acknowledge_conflict(1).await.unwrap();
        let resumed = wait_for(&handle, |s| s.high_water_seq >= Some(100)).await;
        assert_eq!(resumed.role, Role::Leader);
        assert!(resumed.pending <= 16);

        handle.terminate().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resume_point_prefers_checkpoint() {
        let checkpoints = InMemoryCheckpointStore::new();
        let id = IteratorId::from("it-a");

        let fresh = resume_point(&checkpoints, &id, 5).await.unwrap();
        assert_eq!(
            fresh,
            ResumePoint {
                seq: 5,
                from_checkpoint: false
            }
        );

        checkpoints.record(&Checkpoint::now(id.clone(), 10)).await.unwrap();
        let resumed = resume_point(&checkpoints, &id, 5).await.unwrap();
        assert_eq!(resumed.seq, 11);
        assert!(resumed.from_checkpoint);
    }

    #[tokio::test]
    async fn terminating_a_stopped_runtime_is_harmless() {
        let store = Arc::new(InMemoryDigestStore::new());
        let rt = runtime(&store, Role::Support, 0, 0);
        let handle = rt.handle();
        let task = tokio::spawn(rt.run());

        IteratorControl::terminate(&handle).await.unwrap();
        task.await.unwrap().unwrap();
        IteratorControl::terminate(&handle).await.unwrap();
        let status = IteratorControl::status(&handle).await.unwrap();
        assert_eq!(status.role, Role::Terminating);
    }
}
