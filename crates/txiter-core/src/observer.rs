//! Hooks for making iterator activity visible to operators.
//!
//! Core never talks to a metrics backend directly; the daemon plugs one in
//! through [`RuntimeObserver`].

use crate::resolution::{ConflictReport, Observation};
use crate::source::SourceError;
use crate::status::IteratorStatus;
use crate::store::StoreError;
use crate::types::SeqNum;

/// Receives iterator events. Every method defaults to a no-op.
///
/// Implementations are called inline from the resolution loop and must not
/// block.
pub trait RuntimeObserver: Send + Sync {
    /// An observation was classified.
    fn observation(&self, _observation: &Observation) {}

    /// The iterator promoted itself to leader at `seq`.
    fn promoted(&self, _seq: SeqNum) {}

    /// A digest conflict was detected.
    fn conflict(&self, _report: &ConflictReport) {}

    /// A store read or write failed.
    fn store_error(&self, _error: &StoreError) {}

    /// An upstream fetch failed.
    fn source_error(&self, _error: &SourceError) {}

    /// A fresh status snapshot was published.
    fn status(&self, _status: &IteratorStatus) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RuntimeObserver for NoopObserver {}

/// Receives supervisor cycle results. Defaults to a no-op.
pub trait SupervisorObserver: Send + Sync {
    /// A supervisor cycle finished.
    fn cycle(&self, _report: &crate::supervisor::CycleReport) {}
}

impl SupervisorObserver for NoopObserver {}
