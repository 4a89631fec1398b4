//! Failover timer.
//!
//! Each iterator carries its own timeout `X`. A pending candidate that has
//! stayed unconfirmed in the store for longer than `X` is grounds for
//! promotion. Crossing the deadline is advisory; nothing is cancelled.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::SeqNum;

/// Default failover timeout.
pub const DEFAULT_FAILOVER_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-process promotion deadline calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverTimer {
    timeout: Duration,
}

impl FailoverTimer {
    /// Creates a timer with timeout `X`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The configured `X`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When a candidate first seen at `first_seen` becomes eligible.
    #[must_use]
    pub fn deadline(&self, first_seen: Instant) -> Instant {
        first_seen + self.timeout
    }

    /// Whether a candidate first seen at `first_seen` has been unconfirmed
    /// for longer than `X` as of `now`.
    #[must_use]
    pub fn is_expired(&self, first_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(first_seen) >= self.timeout
    }

    /// Lowest seq# among `candidates` whose timeout has elapsed.
    pub fn select_trigger<I>(&self, candidates: I, now: Instant) -> Option<SeqNum>
    where
        I: IntoIterator<Item = (SeqNum, Instant)>,
    {
        candidates
            .into_iter()
            .filter(|&(_, first_seen)| self.is_expired(first_seen, now))
            .map(|(seq, _)| seq)
            .min()
    }
}

impl Default for FailoverTimer {
    fn default() -> Self {
        Self::new(DEFAULT_FAILOVER_TIMEOUT)
    }
}
