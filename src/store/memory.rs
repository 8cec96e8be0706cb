use futures::stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{broadcast, RwLock};

use super::{
    ChangeEvent, ChangeFeed, CommitOutcome, Document, DocumentKey, Listing, StoreClient,
    Versioned, WriteOp,
};
use crate::error::{AppError, AppResult};

/// In-process document store
///
/// Commits run under one write lock so that version bumps, the global
/// change sequence and the broadcast of the change event happen in the
/// same order for every observer. Reads take the read lock only.
///
/// Deleting a document leaves a tombstone holding its last version, so a
/// key's versions never repeat across delete and re-create.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    feed_capacity: usize,
    /// Commits left to fail with `StoreUnavailable`
    failing_commits: AtomicU32,
}

struct StoreState {
    documents: HashMap<String, Versioned<Document>>,
    /// Version at which each deleted key was removed
    tombstones: HashMap<String, u64>,
    sequence: u64,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryStore {
    /// Creates an empty store whose change feed buffers `feed_capacity` events
    pub fn new(feed_capacity: usize) -> Self {
        let feed_capacity = feed_capacity.max(1);
        let (changes, _) = broadcast::channel(feed_capacity);

        Self {
            state: RwLock::new(StoreState {
                documents: HashMap::new(),
                tombstones: HashMap::new(),
                sequence: 0,
                changes,
            }),
            feed_capacity,
            failing_commits: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` commits fail as if the store were unreachable
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Drops every open change feed, as a transport interruption would
    pub async fn interrupt_feeds(&self) {
        let mut state = self.state.write().await;
        let (changes, _) = broadcast::channel(self.feed_capacity);
        state.changes = changes;
        tracing::warn!("Change feeds interrupted");
    }

    /// Number of change feeds currently attached
    pub async fn feed_count(&self) -> usize {
        self.state.read().await.changes.receiver_count()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, key: &DocumentKey) -> AppResult<Option<Versioned<Document>>> {
        let state = self.state.read().await;
        Ok(state.documents.get(&key.to_string()).cloned())
    }

    async fn commit_if_version(
        &self,
        key: &DocumentKey,
        op: WriteOp,
        expected_version: u64,
    ) -> AppResult<CommitOutcome> {
        if self.take_injected_failure() {
            return Err(AppError::StoreUnavailable(format!(
                "commit to {} timed out",
                key
            )));
        }

        let key = key.to_string();
        let mut state = self.state.write().await;

        let live = state.documents.get(&key).map(|doc| doc.version);
        let actual = live.unwrap_or(0);
        if actual != expected_version {
            tracing::debug!(
                key = %key,
                expected = expected_version,
                actual = actual,
                "Rejected stale write"
            );
            return Ok(CommitOutcome::VersionConflict { actual });
        }

        let floor = live
            .or_else(|| state.tombstones.get(&key).copied())
            .unwrap_or(0);
        let version = floor + 1;
        state.sequence += 1;
        let sequence = state.sequence;

        let value = match op {
            WriteOp::Put(document) => {
                state.tombstones.remove(&key);
                state.documents.insert(
                    key.clone(),
                    Versioned {
                        value: document.clone(),
                        version,
                    },
                );
                Some(document)
            }
            WriteOp::Delete => {
                state.documents.remove(&key);
                state.tombstones.insert(key.clone(), version);
                None
            }
        };

        // No receivers is fine; nobody is watching yet
        let _ = state.changes.send(ChangeEvent {
            key,
            value,
            version,
            sequence,
        });

        Ok(CommitOutcome::Committed { version, sequence })
    }

    async fn list(&self, prefix: &str) -> AppResult<Listing> {
        let state = self.state.read().await;

        let mut documents: Vec<(String, Versioned<Document>)> = state
            .documents
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect();
        documents.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Listing {
            documents,
            as_of: state.sequence,
        })
    }

    async fn subscribe(&self, prefix: &str) -> AppResult<ChangeFeed> {
        let receiver = self.state.read().await.changes.subscribe();
        let prefix = prefix.to_string();

        let feed = stream::unfold(Some(receiver), move |receiver| {
            let prefix = prefix.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(event) if event.key.starts_with(&prefix) => {
                            return Some((Ok(event), Some(receiver)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let error = AppError::StoreUnavailable(format!(
                                "change feed lagged by {} events",
                                missed
                            ));
                            return Some((Err(error), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let error =
                                AppError::StoreUnavailable("change feed closed".to_string());
                            return Some((Err(error), None));
                        }
                    }
                }
            }
        });

        Ok(Box::pin(feed))
    }
}
