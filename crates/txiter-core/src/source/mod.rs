//! Upstream transaction source capability.
//!
//! An upstream node answers "which digest sits at seq# `n`?". The answer may
//! not exist yet, and the node may be unreachable; neither is an error that
//! should ever influence roles, it only delays observation.

mod poller;

use async_trait::async_trait;
use thiserror::Error;

pub use poller::{PollerConfig, SourcePoller, DEFAULT_BATCH_SIZE, DEFAULT_IDLE_INTERVAL};

use crate::types::{Digest, SeqDigestEntry, SeqNum};

/// Errors reported by an upstream source. All of them are treated as
/// transient and retried by the [`SourcePoller`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// Network or HTTP level failure.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The node answered with an RPC error.
    #[error("upstream rpc error {code}: {message}")]
    Rpc {
        /// RPC error code.
        code: i64,
        /// RPC error message.
        message: String,
    },

    /// The node answered with something that is not a digest listing.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// Answer to a single-seq# fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The node knows the digest at this seq#.
    Digest(Digest),
    /// The node has not seen this seq# yet.
    NotYetAvailable,
}

/// Read API of one upstream node.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Human readable identity of the node (usually its URL).
    fn node(&self) -> &str;

    /// Fetches the digest at `seq`.
    async fn fetch_at(&self, seq: SeqNum) -> Result<FetchOutcome, SourceError>;

    /// Fetches up to `limit` consecutive digests starting at `start`.
    ///
    /// The result starts at `start` and has no gaps; it is empty when the
    /// node has nothing at `start` yet. Sources with a range API should
    /// override this; the default issues one [`Self::fetch_at`] per seq#.
    async fn fetch_range(
        &self,
        start: SeqNum,
        limit: usize,
    ) -> Result<Vec<SeqDigestEntry>, SourceError> {
        let mut entries = Vec::new();
        let mut seq = start;
        while entries.len() < limit {
            match self.fetch_at(seq).await {
                Ok(FetchOutcome::Digest(digest)) => {
                    entries.push(SeqDigestEntry::new(seq, digest));
                },
                Ok(FetchOutcome::NotYetAvailable) => break,
                // Keep what was fetched; the poller retries from the gap.
                Err(_) if !entries.is_empty() => break,
                Err(e) => return Err(e),
            }
            let Some(next) = seq.checked_add(1) else {
                break;
            };
            seq = next;
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Knows seq# 0..5, optionally failing at seq# 3.
    struct Flaky {
        fail_at_three: AtomicBool,
    }

    #[async_trait]
    impl UpstreamSource for Flaky {
        fn node(&self) -> &str {
            "flaky"
        }

        async fn fetch_at(&self, seq: SeqNum) -> Result<FetchOutcome, SourceError> {
            if seq == 3 && self.fail_at_three.load(Ordering::SeqCst) {
                return Err(SourceError::Transport("reset".into()));
            }
            if seq < 5 {
                Ok(FetchOutcome::Digest(Digest::from(format!("d{seq}").as_str())))
            } else {
                Ok(FetchOutcome::NotYetAvailable)
            }
        }
    }

    fn seqs(entries: &[SeqDigestEntry]) -> Vec<SeqNum> {
        entries.iter().map(|entry| entry.seq).collect()
    }

    #[tokio::test]
    async fn default_range_stops_at_tail_and_limit() {
        let source = Flaky {
            fail_at_three: AtomicBool::new(false),
        };
        assert_eq!(seqs(&source.fetch_range(1, 2).await.unwrap()), vec![1, 2]);
        assert_eq!(seqs(&source.fetch_range(3, 10).await.unwrap()), vec![3, 4]);
        assert!(source.fetch_range(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn default_range_keeps_prefix_before_an_error() {
        let source = Flaky {
            fail_at_three: AtomicBool::new(true),
        };
        assert_eq!(seqs(&source.fetch_range(0, 10).await.unwrap()), vec![0, 1, 2]);
        assert!(matches!(
            source.fetch_range(3, 10).await,
            Err(SourceError::Transport(_))
        ));
    }
}
