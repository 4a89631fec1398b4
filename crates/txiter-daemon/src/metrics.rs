//! Prometheus metrics.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `txiter_role` | Gauge (1 for the current role) | `role` |
//! | `txiter_high_water_seq` | Gauge (-1 before anything resolved) | |
//! | `txiter_pending_candidates` | Gauge | |
//! | `txiter_conflicts_active` | Gauge | |
//! | `txiter_observations_total` | Counter | `outcome` |
//! | `txiter_promotions_total` | Counter | |
//! | `txiter_conflicts_total` | Counter | |
//! | `txiter_store_errors_total` | Counter | |
//! | `txiter_source_errors_total` | Counter | |
//! | `txiter_supervisor_leaders` | Gauge | |
//! | `txiter_supervisor_terminations_total` | Counter | |
//! | `txiter_supervisor_checkpoints_total` | Counter | |
//! | `txiter_supervisor_unreachable_iterators` | Gauge | |
//!
//! Sustained `txiter_store_errors_total` growth or a non-zero
//! `txiter_conflicts_active` needs an operator.

use std::sync::Arc;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;
use txiter_core::checkpoint::CheckpointWrite;
use txiter_core::observer::{RuntimeObserver, SupervisorObserver};
use txiter_core::resolution::{ConflictReport, Observation};
use txiter_core::source::SourceError;
use txiter_core::store::StoreError;
use txiter_core::supervisor::CycleReport;
use txiter_core::{IteratorStatus, Role, SeqNum};

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

const ROLES: [Role; 3] = [Role::Support, Role::Leader, Role::Terminating];

fn register<M>(registry: &Registry, metric: M) -> MetricsResult<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Metrics of one iterator process. Cheap to clone.
#[derive(Clone)]
pub struct IteratorMetrics {
    role: IntGaugeVec,
    high_water_seq: IntGauge,
    pending_candidates: IntGauge,
    conflicts_active: IntGauge,
    observations_total: IntCounterVec,
    promotions_total: IntCounter,
    conflicts_total: IntCounter,
    store_errors_total: IntCounter,
    source_errors_total: IntCounter,
}

impl IteratorMetrics {
    /// Creates iterator metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        Ok(Self {
            role: register(
                registry,
                IntGaugeVec::new(
                    Opts::new("txiter_role", "Current iterator role (1 = active)"),
                    &["role"],
                )?,
            )?,
            high_water_seq: register(
                registry,
                IntGauge::new("txiter_high_water_seq", "Contiguous resolved seq# frontier")?,
            )?,
            pending_candidates: register(
                registry,
                IntGauge::new("txiter_pending_candidates", "Observations awaiting store confirmation")?,
            )?,
            conflicts_active: register(
                registry,
                IntGauge::new("txiter_conflicts_active", "Unresolved digest conflicts")?,
            )?,
            observations_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("txiter_observations_total", "Observations by outcome"),
                    &["outcome"],
                )?,
            )?,
            promotions_total: register(
                registry,
                IntCounter::new("txiter_promotions_total", "Support to leader promotions")?,
            )?,
            conflicts_total: register(
                registry,
                IntCounter::new("txiter_conflicts_total", "Digest conflicts detected")?,
            )?,
            store_errors_total: register(
                registry,
                IntCounter::new("txiter_store_errors_total", "Failed digest store operations")?,
            )?,
            source_errors_total: register(
                registry,
                IntCounter::new("txiter_source_errors_total", "Failed upstream fetches")?,
            )?,
        })
    }
}

fn seq_gauge(seq: Option<SeqNum>) -> i64 {
    seq.map_or(-1, |seq| i64::try_from(seq).unwrap_or(i64::MAX))
}

fn count_gauge(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl RuntimeObserver for IteratorMetrics {
    fn observation(&self, observation: &Observation) {
        self.observations_total
            .with_label_values(&[observation.outcome()])
            .inc();
    }

    fn promoted(&self, _seq: SeqNum) {
        self.promotions_total.inc();
    }

    fn conflict(&self, _report: &ConflictReport) {
        self.conflicts_total.inc();
    }

    fn store_error(&self, _error: &StoreError) {
        self.store_errors_total.inc();
    }

    fn source_error(&self, _error: &SourceError) {
        self.source_errors_total.inc();
    }

    fn status(&self, status: &IteratorStatus) {
        for role in ROLES {
            self.role
                .with_label_values(&[role.as_str()])
                .set(i64::from(role == status.role));
        }
        self.high_water_seq.set(seq_gauge(status.high_water_seq));
        self.pending_candidates.set(count_gauge(status.pending));
        self.conflicts_active.set(count_gauge(status.conflicts.len()));
    }
}

/// Supervisor metrics.
#[derive(Clone)]
pub struct SupervisorMetrics {
    leaders: IntGauge,
    terminations_total: IntCounter,
    checkpoints_total: IntCounter,
    unreachable_iterators: IntGauge,
}

impl SupervisorMetrics {
    /// Creates supervisor metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        Ok(Self {
            leaders: register(
                registry,
                IntGauge::new("txiter_supervisor_leaders", "Leaders seen in the last cycle")?,
            )?,
            terminations_total: register(
                registry,
                IntCounter::new(
                    "txiter_supervisor_terminations_total",
                    "Redundant leaders terminated",
                )?,
            )?,
            checkpoints_total: register(
                registry,
                IntCounter::new(
                    "txiter_supervisor_checkpoints_total",
                    "Checkpoints that advanced",
                )?,
            )?,
            unreachable_iterators: register(
                registry,
                IntGauge::new(
                    "txiter_supervisor_unreachable_iterators",
                    "Iterators that did not answer the last poll",
                )?,
            )?,
        })
    }
}

impl SupervisorObserver for SupervisorMetrics {
    fn cycle(&self, report: &CycleReport) {
        self.leaders.set(count_gauge(report.leaders.len()));
        self.unreachable_iterators
            .set(count_gauge(report.unreachable.len()));
        self.terminations_total
            .inc_by(report.terminated.len() as u64);
        let advanced = report
            .checkpoints
            .iter()
            .filter(|(_, _, write)| matches!(write, CheckpointWrite::Advanced { .. }))
            .count();
        self.checkpoints_total.inc_by(advanced as u64);
    }
}

/// Prometheus registry plus text encoding.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    registry: Registry,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying Prometheus registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Thread-safe shared registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use txiter_core::types::Digest;

    use super::*;

    fn status(role: Role, high_water: Option<SeqNum>) -> IteratorStatus {
        IteratorStatus {
            id: "it-a".into(),
            region: "r".into(),
            upstream_node: "n".into(),
            role,
            high_water_seq: high_water,
            next_seq: 0,
            pending: 3,
            conflicts: Vec::new(),
            store_healthy: true,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn iterator_metrics_track_events_and_status() {
        let registry = MetricsRegistry::new();
        let metrics = IteratorMetrics::new(registry.registry()).unwrap();

        metrics.observation(&Observation::Confirmed { seq: 1 });
        metrics.observation(&Observation::Confirmed { seq: 2 });
        metrics.observation(&Observation::Stale { seq: 0 });
        metrics.promoted(3);
        metrics.conflict(&ConflictReport {
            seq: 4,
            observed: Digest::from("a"),
            stored: Digest::from("b"),
            detected_at: Utc::now(),
        });
        metrics.status(&status(Role::Leader, Some(42)));

        let output = registry.encode_text().unwrap();
        assert!(output.contains("txiter_observations_total{outcome=\"confirmed\"} 2"));
        assert!(output.contains("txiter_observations_total{outcome=\"stale\"} 1"));
        assert!(output.contains("txiter_promotions_total 1"));
        assert!(output.contains("txiter_conflicts_total 1"));
        assert!(output.contains("txiter_role{role=\"leader\"} 1"));
        assert!(output.contains("txiter_role{role=\"support\"} 0"));
        assert!(output.contains("txiter_high_water_seq 42"));
        assert!(output.contains("txiter_pending_candidates 3"));
    }

    #[test]
    fn high_water_is_negative_before_progress() {
        let registry = MetricsRegistry::new();
        let metrics = IteratorMetrics::new(registry.registry()).unwrap();
        metrics.status(&status(Role::Support, None));
        assert!(registry
            .encode_text()
            .unwrap()
            .contains("txiter_high_water_seq -1"));
    }

    #[test]
    fn supervisor_metrics_follow_cycles() {
        let registry = MetricsRegistry::new();
        let metrics = SupervisorMetrics::new(registry.registry()).unwrap();
        metrics.cycle(&CycleReport {
            polled: 3,
            unreachable: vec!["c".into()],
            leaders: vec!["a".into(), "b".into()],
            survivor: Some("b".into()),
            terminated: vec!["a".into()],
            checkpoints: vec![
                ("a".into(), 10, CheckpointWrite::Advanced { previous: None }),
                ("b".into(), 10, CheckpointWrite::Unchanged),
            ],
            ..CycleReport::default()
        });

        let output = registry.encode_text().unwrap();
        assert!(output.contains("txiter_supervisor_leaders 2"));
        assert!(output.contains("txiter_supervisor_unreachable_iterators 1"));
        assert!(output.contains("txiter_supervisor_terminations_total 1"));
        assert!(output.contains("txiter_supervisor_checkpoints_total 1"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = MetricsRegistry::new();
        IteratorMetrics::new(registry.registry()).unwrap();
        assert!(IteratorMetrics::new(registry.registry()).is_err());
    }
}
