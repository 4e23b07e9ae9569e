//! Segment retrieval with provider failover
//!
//! [`SegmentFetcher::fetch`] runs one article retrieval on one session and decodes
//! it. [`SegmentFetcher::fetch_with_failover`] walks the providers in priority
//! order, trying each at most once per segment, and classifies every attempt:
//!
//! | outcome | action |
//! |---|---|
//! | body decoded | segment done |
//! | `NotFound` / `Transient` | next provider |
//! | `Fatal` / permanently unavailable | exclude provider for the rest of the job, next provider |
//! | `Busy` (no session within the acquire timeout) | retry the provider after the others |
//! | `Corrupt` | segment failed, left to repair |

use crate::error::{AcquireError, FetchError};
use crate::nzb::Segment;
use crate::provider::{PooledSession, ProviderId, ProviderPool};
use crate::yenc::{self, DecodedPart};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Rounds a busy provider is retried before it counts as tried
const MAX_BUSY_ROUNDS: u32 = 3;

/// Providers a job has given up on, shared by the job's fetch workers
#[derive(Debug, Default)]
pub struct ProviderExclusions {
    inner: Mutex<ExclusionState>,
}

#[derive(Debug, Default)]
struct ExclusionState {
    excluded: HashMap<ProviderId, String>,
    unreported: Vec<(ProviderId, String)>,
}

impl ProviderExclusions {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExclusionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclude a provider; returns false if it already was
    pub fn exclude(&self, provider: ProviderId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut state = self.lock();
        if state.excluded.contains_key(&provider) {
            return false;
        }
        state.excluded.insert(provider, reason.clone());
        state.unreported.push((provider, reason));
        true
    }

    /// Whether `provider` is excluded
    pub fn contains(&self, provider: ProviderId) -> bool {
        self.lock().excluded.contains_key(&provider)
    }

    /// Exclusion reason for `provider`
    pub fn reason(&self, provider: ProviderId) -> Option<String> {
        self.lock().excluded.get(&provider).cloned()
    }

    /// Exclusions not yet handed out by a previous call
    pub fn take_new(&self) -> Vec<(ProviderId, String)> {
        std::mem::take(&mut self.lock().unreported)
    }
}

/// A decoded segment and where it came from
#[derive(Debug, Clone)]
pub struct FetchedSegment {
    /// Decoded bytes and yEnc header data
    pub part: DecodedPart,
    /// Provider that served it
    pub provider: ProviderId,
    /// Fetch attempts made for this segment, including this one
    pub attempts: u32,
}

/// Result of retrieving one segment across providers
#[derive(Debug)]
pub enum FetchOutcome {
    /// Retrieved and decoded
    Done(FetchedSegment),
    /// Every eligible provider was tried
    Failed {
        /// Fetch attempts made
        attempts: u32,
        /// Last provider tried, if any
        provider: Option<ProviderId>,
        /// Classification of the last failure
        error: FetchError,
    },
    /// The job was cancelled
    Cancelled {
        /// Fetch attempts made before cancellation
        attempts: u32,
    },
}

/// Fetches segments through a [`ProviderPool`]
#[derive(Clone)]
pub struct SegmentFetcher {
    pool: Arc<ProviderPool>,
    acquire_timeout: Duration,
    fetch_timeout: Duration,
}

impl SegmentFetcher {
    /// New fetcher over `pool`
    pub fn new(pool: Arc<ProviderPool>, acquire_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
            fetch_timeout,
        }
    }

    /// The pool sessions are drawn from
    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    /// Retrieve and decode one segment on `session`
    ///
    /// A retrieval that outlives the fetch timeout is transient and discards the
    /// session.
    pub async fn fetch(
        &self,
        segment: &Segment,
        session: &mut PooledSession,
    ) -> Result<DecodedPart, FetchError> {
        let body = match tokio::time::timeout(
            self.fetch_timeout,
            session.fetch_body(&segment.message_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_elapsed) => {
                session.discard();
                return Err(FetchError::Transient(format!(
                    "no response for {} within {:?}",
                    segment.message_id, self.fetch_timeout
                )));
            }
        };

        let part = yenc::decode(&body)?;
        Ok(part)
    }

    /// Retrieve one segment, failing over across providers in priority order
    pub async fn fetch_with_failover(
        &self,
        segment: &Segment,
        exclusions: &ProviderExclusions,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let mut attempts = 0u32;
        let mut last: Option<(ProviderId, FetchError)> = None;
        let mut queue: Vec<(ProviderId, u32)> =
            self.pool.ordered().into_iter().map(|id| (id, 0)).collect();
        let mut index = 0;

        while index < queue.len() {
            let (provider, busy_rounds) = queue[index];
            index += 1;

            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled { attempts };
            }
            if exclusions.contains(provider) {
                continue;
            }

            let mut session = match self
                .pool
                .acquire(provider, self.acquire_timeout, cancel)
                .await
            {
                Ok(session) => session,
                Err(AcquireError::Cancelled) => return FetchOutcome::Cancelled { attempts },
                Err(AcquireError::Busy) => {
                    if busy_rounds + 1 < MAX_BUSY_ROUNDS {
                        queue.push((provider, busy_rounds + 1));
                    } else {
                        last = Some((
                            provider,
                            FetchError::Transient("provider stayed busy".to_string()),
                        ));
                    }
                    continue;
                }
                Err(AcquireError::Unavailable { reason, permanent }) => {
                    if permanent {
                        self.exclude(exclusions, provider, &reason);
                        last = Some((provider, FetchError::Fatal(reason)));
                    } else {
                        last = Some((provider, FetchError::Transient(reason)));
                    }
                    continue;
                }
            };

            attempts += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    session.discard();
                    return FetchOutcome::Cancelled { attempts };
                }
                result = self.fetch(segment, &mut session) => result,
            };
            drop(session);

            match result {
                Ok(part) => {
                    return FetchOutcome::Done(FetchedSegment {
                        part,
                        provider,
                        attempts,
                    });
                }
                Err(FetchError::Corrupt(reason)) => {
                    tracing::warn!(
                        message_id = %segment.message_id,
                        provider = %provider,
                        reason = %reason,
                        "Segment failed integrity check"
                    );
                    return FetchOutcome::Failed {
                        attempts,
                        provider: Some(provider),
                        error: FetchError::Corrupt(reason),
                    };
                }
                Err(FetchError::Fatal(reason)) => {
                    self.exclude(exclusions, provider, &reason);
                    last = Some((provider, FetchError::Fatal(reason)));
                }
                Err(e) => {
                    tracing::debug!(
                        message_id = %segment.message_id,
                        provider = %provider,
                        error = %e,
                        "Segment attempt failed, trying next provider"
                    );
                    last = Some((provider, e));
                }
            }
        }

        let (provider, error) = match last {
            Some((provider, error)) => (Some(provider), error),
            None => (
                None,
                FetchError::Fatal("no eligible provider".to_string()),
            ),
        };
        FetchOutcome::Failed {
            attempts,
            provider,
            error,
        }
    }

    fn exclude(&self, exclusions: &ProviderExclusions, provider: ProviderId, reason: &str) {
        if exclusions.exclude(provider, reason) {
            tracing::warn!(
                provider = %self.pool.provider(provider).map(|p| p.name).unwrap_or_default(),
                reason = %reason,
                "Excluding provider for the remainder of the job"
            );
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::provider::InMemoryConnector;

    fn setup(names: &[(&str, i32)]) -> (SegmentFetcher, InMemoryConnector) {
        let connector = InMemoryConnector::new();
        let providers = names
            .iter()
            .map(|(name, priority)| {
                let mut config = ProviderConfig::new(*name, "localhost");
                config.connections = 2;
                config.priority = *priority;
                config
            })
            .collect();
        let pool = Arc::new(ProviderPool::new(providers, Arc::new(connector.clone())));
        (
            SegmentFetcher::new(pool, Duration::from_secs(1), Duration::from_secs(1)),
            connector,
        )
    }

    fn segment(message_id: &str, bytes: u64) -> Segment {
        Segment {
            file_index: 0,
            segment_index: 0,
            number: 1,
            message_id: message_id.to_string(),
            bytes,
        }
    }

    #[tokio::test]
    async fn fetch_decodes_body() {
        let (fetcher, connector) = setup(&[("a", 0)]);
        let posted = connector.post_file(&["a"], "f.bin", b"0123456789", 100).unwrap();
        let mut session = fetcher
            .pool()
            .acquire(ProviderId(0), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();

        let part = fetcher
            .fetch(&segment(&posted[0].message_id, 10), &mut session)
            .await
            .unwrap();
        assert_eq!(part.data, b"0123456789");
        assert_eq!(part.file_size, 10);
    }

    #[tokio::test]
    async fn transient_failure_falls_over_to_next_provider() {
        let (fetcher, connector) = setup(&[("backup", 5), ("primary", 0)]);
        let posted = connector.post_file(&["primary", "backup"], "f.bin", b"abc", 100).unwrap();
        connector.fail_article("primary", &posted[0].message_id);

        let outcome = fetcher
            .fetch_with_failover(
                &segment(&posted[0].message_id, 3),
                &ProviderExclusions::new(),
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            FetchOutcome::Done(fetched) => {
                assert_eq!(fetched.provider, ProviderId(0));
                assert_eq!(fetched.attempts, 2);
                assert_eq!(fetched.part.data, b"abc");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(connector.fetch_count("primary"), 1);
        assert_eq!(connector.fetch_count("backup"), 1);
    }

    #[tokio::test]
    async fn missing_everywhere_tries_each_provider_once() {
        let (fetcher, connector) = setup(&[("a", 0), ("b", 1), ("c", 2)]);

        let outcome = fetcher
            .fetch_with_failover(
                &segment("gone@test", 10),
                &ProviderExclusions::new(),
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            FetchOutcome::Failed {
                attempts,
                provider,
                error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(provider, Some(ProviderId(2)));
                assert!(matches!(error, FetchError::NotFound { .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        for name in ["a", "b", "c"] {
            assert_eq!(connector.fetch_count(name), 1);
        }
    }

    #[tokio::test]
    async fn rejected_provider_is_excluded_for_later_segments() {
        let (fetcher, connector) = setup(&[("bad", 0), ("good", 1)]);
        connector.reject_auth("bad");
        let posted = connector.post_file(&["good"], "f.bin", b"abcdef", 3).unwrap();
        let exclusions = ProviderExclusions::new();
        let cancel = CancellationToken::new();

        for posted in &posted {
            let outcome = fetcher
                .fetch_with_failover(&segment(&posted.message_id, 3), &exclusions, &cancel)
                .await;
            assert!(matches!(outcome, FetchOutcome::Done(_)));
        }

        assert!(exclusions.contains(ProviderId(0)));
        let reported = exclusions.take_new();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, ProviderId(0));
        assert!(exclusions.take_new().is_empty());
    }

    #[tokio::test]
    async fn corrupt_body_fails_without_trying_others() {
        let (fetcher, connector) = setup(&[("a", 0), ("b", 1)]);
        let body = yenc::encode("f.bin", b"payload", None).unwrap();
        let crc_at = body.windows(6).rposition(|w| w == b"crc32=").unwrap() + 6;
        let mut corrupt = body.clone();
        corrupt[crc_at..crc_at + 8].copy_from_slice(b"00000000");
        connector.insert("a", "x@test", corrupt);
        connector.insert("b", "x@test", body);

        let outcome = fetcher
            .fetch_with_failover(
                &segment("x@test", 7),
                &ProviderExclusions::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                attempts: 1,
                error: FetchError::Corrupt(_),
                ..
            }
        ));
        assert_eq!(connector.fetch_count("b"), 0);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_fetching() {
        let (fetcher, connector) = setup(&[("a", 0)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = fetcher
            .fetch_with_failover(&segment("x@test", 1), &ProviderExclusions::new(), &cancel)
            .await;
        assert!(matches!(outcome, FetchOutcome::Cancelled { attempts: 0 }));
        assert_eq!(connector.fetch_count("a"), 0);
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_transient() {
        let connector = InMemoryConnector::new();
        connector.set_latency(Duration::from_millis(200));
        let pool = Arc::new(ProviderPool::new(
            vec![ProviderConfig::new("slow", "localhost")],
            Arc::new(connector.clone()),
        ));
        let fetcher = SegmentFetcher::new(
            Arc::clone(&pool),
            Duration::from_secs(1),
            Duration::from_millis(20),
        );
        let mut session = pool
            .acquire(ProviderId(0), Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();

        let err = fetcher
            .fetch(&segment("x@test", 1), &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
    }
}
