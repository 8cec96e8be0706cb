//! Optimistic-concurrency retry driver
//!
//! Every write in the crate is a read / compute / conditional-write cycle
//! against one document. [`ConflictRetryCoordinator::execute`] runs that
//! cycle and starts over from a fresh read whenever the store reports a
//! version conflict or a transient outage.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    error::{AppError, AppResult},
    store::{CommitOutcome, DocumentCodec, DocumentKey, StoreClient, Versioned, WriteOp},
};

/// Backoff and attempt bounds for retried operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomise each delay within [d/2, d] so racing writers spread out
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; handy in tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = (scaled.min(self.max_delay.as_millis() as f64)).max(0.0) as u64;

        if self.jitter && capped > 1 {
            Duration::from_millis(rand::thread_rng().gen_range(capped / 2..=capped))
        } else {
            Duration::from_millis(capped)
        }
    }
}

/// What an attempt wants done with the document it was shown
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
    Put(T),
    Delete,
    /// Leave the document as it is; nothing is written
    Keep,
}

/// Outcome of a finished cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    /// Document after the cycle; `None` if absent or deleted
    pub value: Option<T>,
    /// Version the value is at (the deleted version for deletes)
    pub version: u64,
    /// False when the attempt chose [`Mutation::Keep`]
    pub written: bool,
}

#[derive(Clone)]
pub struct ConflictRetryCoordinator {
    store: Arc<dyn StoreClient>,
    policy: RetryPolicy,
}

impl ConflictRetryCoordinator {
    pub fn new(store: Arc<dyn StoreClient>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs read / `attempt` / conditional write until one commit lands.
    ///
    /// `attempt` sees the decoded current document (or `None`) and may be
    /// called once per try, so it must not have side effects. Retryable
    /// failures start a fresh cycle after a backoff; anything else,
    /// including errors returned by `attempt`, is returned as is. Running
    /// out of attempts yields `Conflict` (or `ServiceUnavailable` when the
    /// last failure was an outage).
    pub async fn execute<T, F>(&self, key: &DocumentKey, mut attempt: F) -> AppResult<Committed<T>>
    where
        T: DocumentCodec + Clone + Send,
        F: FnMut(Option<&Versioned<T>>) -> AppResult<Mutation<T>> + Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt_no in 1..=max_attempts {
            match self.run_cycle(key, &mut attempt).await {
                Ok(committed) => {
                    if attempt_no > 1 {
                        tracing::debug!(
                            key = %key,
                            attempts = attempt_no,
                            "Write landed after retry"
                        );
                    }
                    return Ok(committed);
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        key = %key,
                        attempt = attempt_no,
                        error = %e,
                        "Retryable write failure"
                    );
                    last_error = Some(e);
                    if attempt_no < max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt_no)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let error = match last_error {
            Some(AppError::StoreUnavailable(reason)) => AppError::ServiceUnavailable(reason),
            _ => AppError::Conflict {
                key: key.to_string(),
                attempts: max_attempts,
            },
        };
        tracing::warn!(key = %key, attempts = max_attempts, error = %error, "Giving up on write");
        Err(error)
    }

    async fn run_cycle<T, F>(&self, key: &DocumentKey, attempt: &mut F) -> AppResult<Committed<T>>
    where
        T: DocumentCodec + Clone + Send,
        F: FnMut(Option<&Versioned<T>>) -> AppResult<Mutation<T>> + Send,
    {
        let current = match self.store.get(key).await? {
            Some(stored) => Some(Versioned {
                value: T::decode(&stored.value)?,
                version: stored.version,
            }),
            None => None,
        };
        let expected_version = current.as_ref().map_or(0, |c| c.version);

        let (op, value) = match attempt(current.as_ref())? {
            Mutation::Keep => {
                return Ok(Committed {
                    value: current.map(|c| c.value),
                    version: expected_version,
                    written: false,
                });
            }
            // Deleting something that is not there is already done
            Mutation::Delete if current.is_none() => {
                return Ok(Committed {
                    value: None,
                    version: 0,
                    written: false,
                });
            }
            Mutation::Delete => (WriteOp::Delete, None),
            Mutation::Put(value) => (WriteOp::Put(value.encode()), Some(value)),
        };

        match self
            .store
            .commit_if_version(key, op, expected_version)
            .await?
        {
            CommitOutcome::Committed { version, .. } => Ok(Committed {
                value,
                version,
                written: true,
            }),
            CommitOutcome::VersionConflict { actual } => Err(AppError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemId, RatingAggregate};
    use crate::store::{Document, MockStoreClient};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> DocumentKey {
        DocumentKey::Aggregate(ItemId::new("42").unwrap())
    }

    fn stored(total: u64, version: u64) -> Versioned<Document> {
        let mut aggregate = RatingAggregate::empty(ItemId::new("42").unwrap());
        for _ in 0..total {
            aggregate = aggregate.with_contribution(3.0);
        }
        Versioned {
            value: aggregate.encode(),
            version,
        }
    }

    fn add_one(
        current: Option<&Versioned<RatingAggregate>>,
    ) -> AppResult<Mutation<RatingAggregate>> {
        let base = current
            .map(|c| c.value.clone())
            .unwrap_or_else(|| RatingAggregate::empty(ItemId::new("42").unwrap()));
        Ok(Mutation::Put(base.with_contribution(5.0)))
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for(40), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for attempt in 1..8 {
            let ceiling = RetryPolicy {
                jitter: false,
                ..policy.clone()
            }
            .delay_for(attempt);
            let delay = policy.delay_for(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[tokio::test]
    async fn test_conflict_triggers_fresh_read() {
        let mut store = MockStoreClient::new();
        let reads = Arc::new(AtomicU32::new(0));

        let reads_in_get = reads.clone();
        store.expect_get().times(2).returning(move |_| {
            // Second read sees the competing writer's commit
            let n = reads_in_get.fetch_add(1, Ordering::SeqCst);
            Ok(if n == 0 { None } else { Some(stored(1, 1)) })
        });
        store
            .expect_commit_if_version()
            .times(2)
            .returning(|_, _, expected| {
                Ok(if expected == 0 {
                    CommitOutcome::VersionConflict { actual: 1 }
                } else {
                    CommitOutcome::Committed {
                        version: expected + 1,
                        sequence: 2,
                    }
                })
            });

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(3));
        let committed = coordinator.execute(&key(), add_one).await.unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(committed.version, 2);
        let aggregate = committed.value.unwrap();
        assert_eq!(aggregate.total_ratings, 2);
        assert!((aggregate.average_rating - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_surface_as_conflict() {
        let mut store = MockStoreClient::new();
        store.expect_get().times(3).returning(|_| Ok(None));
        store
            .expect_commit_if_version()
            .times(3)
            .returning(|_, _, _| Ok(CommitOutcome::VersionConflict { actual: 7 }));

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(3));
        let err = coordinator.execute(&key(), add_one).await.unwrap_err();

        assert_eq!(
            err,
            AppError::Conflict {
                key: "movies/42".to_string(),
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let mut store = MockStoreClient::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_commit_if_version()
            .times(1)
            .returning(|_, _, _| Err(AppError::PermissionDenied("rules".to_string())));

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(5));
        let err = coordinator.execute(&key(), add_one).await.unwrap_err();

        assert_eq!(err, AppError::PermissionDenied("rules".to_string()));
    }

    #[tokio::test]
    async fn test_attempt_error_aborts_without_write() {
        let mut store = MockStoreClient::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store.expect_commit_if_version().never();

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(5));
        let err = coordinator
            .execute::<RatingAggregate, _>(&key(), |_| {
                Err(AppError::NotFound("movies/42".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_outage_retried_then_service_unavailable() {
        let mut store = MockStoreClient::new();
        store
            .expect_get()
            .times(2)
            .returning(|_| Err(AppError::StoreUnavailable("timeout".to_string())));

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(2));
        let err = coordinator.execute(&key(), add_one).await.unwrap_err();

        assert_eq!(err, AppError::ServiceUnavailable("timeout".to_string()));
    }

    #[tokio::test]
    async fn test_outage_then_success() {
        let mut store = MockStoreClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_get = calls.clone();
        store.expect_get().times(2).returning(move |_| {
            if calls_in_get.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AppError::StoreUnavailable("blip".to_string()))
            } else {
                Ok(None)
            }
        });
        store
            .expect_commit_if_version()
            .times(1)
            .returning(|_, _, _| {
                Ok(CommitOutcome::Committed {
                    version: 1,
                    sequence: 1,
                })
            });

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(3));
        let committed = coordinator.execute(&key(), add_one).await.unwrap();
        assert_eq!(committed.version, 1);
        assert!(committed.written);
    }

    #[tokio::test]
    async fn test_keep_and_delete_of_missing_write_nothing() {
        let mut store = MockStoreClient::new();
        store.expect_get().times(2).returning(|_| Ok(None));
        store.expect_commit_if_version().never();

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(1));

        let kept = coordinator
            .execute::<RatingAggregate, _>(&key(), |_| Ok(Mutation::Keep))
            .await
            .unwrap();
        assert!(!kept.written);
        assert_eq!(kept.value, None);

        let deleted = coordinator
            .execute::<RatingAggregate, _>(&key(), |_| Ok(Mutation::Delete))
            .await
            .unwrap();
        assert!(!deleted.written);
    }

    #[tokio::test]
    async fn test_malformed_document_is_fatal() {
        let mut store = MockStoreClient::new();
        store.expect_get().times(1).returning(|_| {
            Ok(Some(Versioned {
                value: Document::new().with("itemId", "42"),
                version: 3,
            }))
        });

        let coordinator = ConflictRetryCoordinator::new(Arc::new(store), RetryPolicy::immediate(5));
        let err = coordinator.execute(&key(), add_one).await.unwrap_err();
        assert!(matches!(err, AppError::MalformedDocument(_)));
    }
}
