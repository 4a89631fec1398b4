//! Source poller: turns an [`UpstreamSource`] into an endless, ordered
//! sequence of `(seq#, digest)` pairs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::UpstreamSource;
use crate::backoff::{Backoff, BackoffConfig};
use crate::observer::{NoopObserver, RuntimeObserver};
use crate::types::{SeqDigestEntry, SeqNum};

/// How many digests are fetched per upstream call by default.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// How long to wait before polling again when the node has nothing new.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(5);

/// Poller tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Digests requested per upstream call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep when the node has nothing at the next seq# yet.
    #[serde(default = "default_idle_interval", with = "crate::humantime_serde")]
    pub idle_interval: Duration,

    /// Delay policy between failed fetches.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_idle_interval() -> Duration {
    DEFAULT_IDLE_INTERVAL
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Unbounded producer of contiguous `(seq#, digest)` pairs for a
/// single upstream node.
///
/// Fetch failures are retried forever with backoff. They are reported to the
/// observer but never surface to the caller: an iterator that cannot see its
/// node simply has nothing to offer.
pub struct SourcePoller<S: ?Sized> {
    source: Arc<S>,
    config: PollerConfig,
    next_seq: SeqNum,
    buffer: VecDeque<SeqDigestEntry>,
    backoff: Backoff,
    observer: Arc<dyn RuntimeObserver>,
}

impl<S: UpstreamSource + ?Sized> SourcePoller<S> {
    /// Creates a poller whose first yielded entry is at `start`.
    #[must_use]
    pub fn new(source: Arc<S>, config: PollerConfig, start: SeqNum) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            source,
            config,
            next_seq: start,
            buffer: VecDeque::new(),
            backoff,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Reports fetch failures to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RuntimeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The seq# the next call to [`Self::next`] yields.
    #[must_use]
    pub const fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    /// Waits for and returns the next entry.
    pub async fn next(&mut self) -> SeqDigestEntry {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                self.next_seq = entry.seq.saturating_add(1);
                return entry;
            }
            self.fill().await;
        }
    }

    async fn fill(&mut self) {
        let start = self.next_seq;
        let limit = self.config.batch_size.max(1);

        match self.source.fetch_range(start, limit).await {
            Ok(entries) => {
                self.backoff.reset();
                let fetched = entries.len();
                let contiguous = contiguous_from(start, entries);
                if contiguous.len() < fetched {
                    warn!(
                        node = self.source.node(),
                        start,
                        fetched,
                        kept = contiguous.len(),
                        "Upstream returned a non-contiguous batch, truncating at the first gap"
                    );
                }
                if contiguous.is_empty() {
                    tokio::time::sleep(self.config.idle_interval).await;
                } else {
                    self.buffer.extend(contiguous);
                }
            },
            Err(err) => {
                self.observer.source_error(&err);
                let delay = self.backoff.next_delay();
                if self.backoff.attempts() == 1 {
                    warn!(node = self.source.node(), start, error = %err, "Upstream fetch failed, retrying");
                } else {
                    debug!(
                        node = self.source.node(),
                        start,
                        attempts = self.backoff.attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Upstream fetch still failing"
                    );
                }
                tokio::time::sleep(delay).await;
            },
        }
    }
}

/// Keeps the prefix of `entries` that runs `start, start + 1, ...` without gaps.
fn contiguous_from(start: SeqNum, entries: Vec<SeqDigestEntry>) -> Vec<SeqDigestEntry> {
    let mut expected = Some(start);
    entries
        .into_iter()
        .take_while(|entry| {
            if expected == Some(entry.seq) {
                expected = entry.seq.checked_add(1);
                true
            } else {
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::source::{FetchOutcome, SourceError};
    use crate::types::Digest;

    /// Replays scripted answers per call; once the script runs out it serves
    /// `available` like a node that knows a fixed number of digests.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<SeqDigestEntry>, SourceError>>>,
        available: SeqNum,
        calls: Mutex<Vec<SeqNum>>,
    }

    impl ScriptedSource {
        fn new(available: SeqNum) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                available,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, answer: Result<Vec<SeqDigestEntry>, SourceError>) {
            self.script.lock().unwrap().push_back(answer);
        }
    }

    #[async_trait]
    impl UpstreamSource for ScriptedSource {
        fn node(&self) -> &str {
            "scripted"
        }

        async fn fetch_at(&self, seq: SeqNum) -> Result<FetchOutcome, SourceError> {
            if seq < self.available {
                Ok(FetchOutcome::Digest(Digest::from(format!("d{seq}").as_str())))
            } else {
                Ok(FetchOutcome::NotYetAvailable)
            }
        }

        async fn fetch_range(
            &self,
            start: SeqNum,
            limit: usize,
        ) -> Result<Vec<SeqDigestEntry>, SourceError> {
            self.calls.lock().unwrap().push(start);
            if let Some(answer) = self.script.lock().unwrap().pop_front() {
                return answer;
            }
            let end = start.saturating_add(limit as u64).min(self.available);
            Ok((start..end)
                .map(|seq| SeqDigestEntry::new(seq, format!("d{seq}").as_str()))
                .collect())
        }
    }

    async fn take<S: UpstreamSource + ?Sized>(
        poller: &mut SourcePoller<S>,
        n: usize,
    ) -> Vec<SeqNum> {
        let mut seqs = Vec::with_capacity(n);
        for _ in 0..n {
            seqs.push(poller.next().await.seq);
        }
        seqs
    }

    fn config(batch_size: usize) -> PollerConfig {
        PollerConfig {
            batch_size,
            idle_interval: Duration::from_millis(5),
            backoff: BackoffConfig::Fixed {
                delay: Duration::from_millis(50),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn yields_contiguous_entries_in_order_across_batches() {
        let source = Arc::new(ScriptedSource::new(7));
        let mut poller = SourcePoller::new(Arc::clone(&source), config(3), 2);

        assert_eq!(take(&mut poller, 5).await, vec![2, 3, 4, 5, 6]);
        assert_eq!(poller.next_seq(), 7);
        assert_eq!(*source.calls.lock().unwrap(), vec![2, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_retried_and_never_surface() {
        let source = Arc::new(ScriptedSource::new(3));
        source.push(Err(SourceError::Transport("connection refused".into())));
        source.push(Err(SourceError::Transport("connection refused".into())));

        let mut poller = SourcePoller::new(Arc::clone(&source), config(10), 0);
        let started = tokio::time::Instant::now();
        let first = poller.next().await;

        assert_eq!(first, SeqDigestEntry::new(0, "d0"));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(source.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_while_nothing_new_is_available() {
        let source = Arc::new(ScriptedSource::new(1));
        let mut poller = SourcePoller::new(Arc::clone(&source), config(10), 0);
        assert_eq!(poller.next().await.seq, 0);

        let next = tokio::time::timeout(Duration::from_millis(100), poller.next()).await;
        assert!(next.is_err(), "nothing past seq# 0 exists yet");
        assert_eq!(poller.next_seq(), 1);
        assert!(source.calls.lock().unwrap().len() > 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_contiguous_batches_are_truncated_at_the_gap() {
        let source = Arc::new(ScriptedSource::new(10));
        source.push(Ok(vec![
            SeqDigestEntry::new(0, "d0"),
            SeqDigestEntry::new(1, "d1"),
            SeqDigestEntry::new(3, "d3"),
        ]));

        let mut poller = SourcePoller::new(Arc::clone(&source), config(10), 0);
        assert_eq!(take(&mut poller, 4).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn default_fetch_range_uses_fetch_at() {
        struct PointSource;

        #[async_trait]
        impl UpstreamSource for PointSource {
            fn node(&self) -> &str {
                "point"
            }

            async fn fetch_at(&self, seq: SeqNum) -> Result<FetchOutcome, SourceError> {
                match seq {
                    0..=2 => Ok(FetchOutcome::Digest(Digest::new(vec![u8::try_from(seq).unwrap()]))),
                    3 => Err(SourceError::Transport("reset".into())),
                    _ => Ok(FetchOutcome::NotYetAvailable),
                }
            }
        }

        let entries = PointSource.fetch_range(1, 10).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert!(PointSource.fetch_range(3, 10).await.is_err());
        assert!(PointSource.fetch_range(4, 10).await.unwrap().is_empty());
    }
}
