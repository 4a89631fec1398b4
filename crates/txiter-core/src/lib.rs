//! Redundant broadcast-transaction iterators.
//!
//! Several iterator processes poll possibly different upstream nodes for the
//! digest at each sender seq# and reconcile what they see through a shared,
//! insert-only [`store::DigestStore`]. Leadership is self-detected: a support
//! iterator whose pending observation stays unconfirmed for longer than its
//! own failover timeout promotes itself and starts writing. Concurrent
//! leaders are harmless because every write is an idempotent insert; an
//! out-of-band [`supervisor::Supervisor`] converges them back to one and
//! records restart checkpoints.
//!
//! # Modules
//!
//! - [`types`]: seq#, digests, iterator ids
//! - [`store`]: digest store capability and backends
//! - [`source`]: upstream capability and the source poller
//! - [`role`]: the role state machine
//! - [`failover`]: the per-process failover timer
//! - [`resolution`]: the resolution engine
//! - [`checkpoint`]: restart checkpoints
//! - [`supervisor`]: single-leader enforcement
//! - [`runtime`]: poller, resolver and sweep scheduling for one iterator
//! - [`config`]: TOML configuration

pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod failover;
pub mod observer;
pub mod resolution;
pub mod role;
pub mod runtime;
pub mod source;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod types;

mod humantime_serde;

pub use checkpoint::{Checkpoint, CheckpointStore, SqliteCheckpointStore};
pub use config::TxiterConfig;
pub use resolution::{ConflictReport, Observation, ResolutionEngine};
pub use role::{Role, RoleMachine};
pub use runtime::{IteratorRuntime, RuntimeHandle};
pub use status::{IteratorIdentity, IteratorStatus};
pub use store::{DigestStore, InsertOutcome, SqliteDigestStore};
pub use supervisor::{IteratorControl, Supervisor};
pub use types::{Digest, IteratorId, SeqDigestEntry, SeqNum};
