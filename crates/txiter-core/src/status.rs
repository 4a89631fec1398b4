//! Iterator status as reported to the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resolution::{ConflictReport, EngineSnapshot};
use crate::role::Role;
use crate::types::{IteratorId, SeqNum};

/// Static identity of an iterator process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorIdentity {
    /// Stable id; restarts reuse it.
    pub id: IteratorId,
    /// Deployment region.
    pub region: String,
    /// Upstream node this iterator polls.
    pub upstream_node: String,
}

/// Status of one iterator process, served at `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorStatus {
    /// Iterator id.
    pub id: IteratorId,
    /// Deployment region.
    pub region: String,
    /// Upstream node.
    pub upstream_node: String,
    /// Current role.
    pub role: Role,
    /// Contiguous resolved frontier.
    pub high_water_seq: Option<SeqNum>,
    /// Next seq# to resolve.
    pub next_seq: SeqNum,
    /// Pending candidates (or queued leader writes).
    pub pending: usize,
    /// Outstanding digest conflicts.
    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,
    /// Whether the last store operation succeeded.
    pub store_healthy: bool,
    /// When this process instance started.
    pub started_at: DateTime<Utc>,
}

impl IteratorStatus {
    /// Combines an identity with an engine snapshot.
    #[must_use]
    pub fn from_snapshot(
        identity: &IteratorIdentity,
        snapshot: EngineSnapshot,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: identity.id.clone(),
            region: identity.region.clone(),
            upstream_node: identity.upstream_node.clone(),
            role: snapshot.role,
            high_water_seq: snapshot.high_water_seq,
            next_seq: snapshot.next_seq,
            pending: snapshot.pending,
            conflicts: snapshot.conflicts,
            store_healthy: snapshot.store_healthy,
            started_at,
        }
    }

    /// Coarse health derived from the status.
    #[must_use]
    pub fn health(&self) -> Health {
        if self.store_healthy && self.conflicts.is_empty() {
            Health::Healthy
        } else {
            Health::Degraded
        }
    }
}

/// Health of an iterator from the supervisor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Reachable, store reachable, no conflicts.
    Healthy,
    /// Reachable but stalled on the store or a conflict.
    Degraded,
    /// Status could not be fetched.
    Unreachable,
}

impl Health {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Digest;

    fn status() -> IteratorStatus {
        IteratorStatus {
            id: "it-a".into(),
            region: "eu-west".into(),
            upstream_node: "http://node-a:9000".into(),
            role: Role::Leader,
            high_water_seq: Some(10),
            next_seq: 11,
            pending: 0,
            conflicts: Vec::new(),
            store_healthy: true,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn health_reflects_store_and_conflicts() {
        let mut status = status();
        assert_eq!(status.health(), Health::Healthy);

        status.conflicts.push(ConflictReport {
            seq: 20,
            observed: Digest::from("dX"),
            stored: Digest::from("dY"),
            detected_at: Utc::now(),
        });
        assert_eq!(status.health(), Health::Degraded);
    }

    #[test]
    fn status_json_round_trips() {
        let status = status();
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"role\":\"leader\""));
        assert!(json.contains("\"high_water_seq\":10"));
        let parsed: IteratorStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
