//! Live watchlist feed
//!
//! Each subscriber gets its own pump task and bounded channel. The pump
//! lists the user's items, then follows the store's change feed, emitting
//! the full list after every change. When the feed breaks it lists again
//! and carries on from the fresh state instead of replaying what it missed.

use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{AppError, AppResult},
    models::{ItemId, UserId, WatchlistItem, WatchlistSnapshot},
    services::retry::RetryPolicy,
    store::{ChangeEvent, ChangeFeed, Document, DocumentCodec, DocumentKey, StoreClient},
};

/// Stream of full watchlist snapshots for one user
///
/// Dropping it or calling [`WatchlistSubscription::cancel`] stops delivery
/// and detaches from the store.
pub struct WatchlistSubscription {
    receiver: mpsc::Receiver<AppResult<WatchlistSnapshot>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchlistSubscription {
    pub(crate) fn spawn(
        store: Arc<dyn StoreClient>,
        user_id: UserId,
        reconnect: RetryPolicy,
        buffer: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();

        let pump = SnapshotPump {
            store,
            prefix: DocumentKey::watchlist_prefix(&user_id),
            user_id,
            reconnect,
            sender,
            cancel: cancel.clone(),
            items: BTreeMap::new(),
            cursor: 0,
            last_emitted: None,
        };
        let task = tokio::spawn(pump.run());

        Self {
            receiver,
            cancel,
            task,
        }
    }

    /// Stops delivery; no snapshot is yielded after this returns
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the pump task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for WatchlistSubscription {
    type Item = AppResult<WatchlistSnapshot>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}

impl Drop for WatchlistSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why the pump left its follow loop
enum FeedEnd {
    Cancelled,
    Interrupted(AppError),
}

struct SnapshotPump {
    store: Arc<dyn StoreClient>,
    user_id: UserId,
    prefix: String,
    reconnect: RetryPolicy,
    sender: mpsc::Sender<AppResult<WatchlistSnapshot>>,
    cancel: CancellationToken,
    items: BTreeMap<ItemId, WatchlistItem>,
    /// Highest change sequence folded into `items`
    cursor: u64,
    last_emitted: Option<Vec<WatchlistItem>>,
}

impl SnapshotPump {
    async fn run(mut self) {
        tracing::debug!(user_id = %self.user_id, "Watchlist subscription started");
        let cancel = self.cancel.clone();
        let max_attempts = self.reconnect.max_attempts.max(1);
        let mut failures = 0u32;

        loop {
            let synced = tokio::select! {
                _ = cancel.cancelled() => break,
                synced = self.sync() => synced,
            };

            let error = match synced {
                Ok(feed) => {
                    failures = 0;
                    match self.follow(feed).await {
                        FeedEnd::Cancelled => break,
                        FeedEnd::Interrupted(e) if e.is_retryable() => {
                            tracing::warn!(
                                user_id = %self.user_id,
                                error = %e,
                                "Watchlist feed interrupted, resubscribing"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(self.reconnect.delay_for(1)) => {}
                            }
                            continue;
                        }
                        FeedEnd::Interrupted(e) => e,
                    }
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures < max_attempts {
                        tracing::warn!(
                            user_id = %self.user_id,
                            attempt = failures,
                            error = %e,
                            "Watchlist resubscribe failed"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect.delay_for(failures)) => {}
                        }
                        continue;
                    }
                    AppError::ServiceUnavailable(e.to_string())
                }
                Err(e) => e,
            };

            tracing::error!(
                user_id = %self.user_id,
                error = %error,
                "Watchlist subscription failed"
            );
            self.deliver(Err(error)).await;
            break;
        }

        tracing::debug!(user_id = %self.user_id, "Watchlist subscription stopped");
    }

    /// Attaches a feed, then lists current state and emits it
    async fn sync(&mut self) -> AppResult<ChangeFeed> {
        // Subscribe before listing so nothing committed in between is lost
        let feed = self.store.subscribe(&self.prefix).await?;
        let listing = self.store.list(&self.prefix).await?;

        self.items.clear();
        for (key, stored) in &listing.documents {
            if let Some(item) = self.decode(key, &stored.value) {
                self.items.insert(item.item_id.clone(), item);
            }
        }
        self.cursor = self.cursor.max(listing.as_of);
        self.emit().await;

        Ok(feed)
    }

    async fn follow(&mut self, mut feed: ChangeFeed) -> FeedEnd {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return FeedEnd::Cancelled,
                next = feed.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if event.sequence <= self.cursor {
                        continue;
                    }
                    self.apply(event);
                    self.emit().await;
                    if self.cancel.is_cancelled() {
                        return FeedEnd::Cancelled;
                    }
                }
                Some(Err(e)) => return FeedEnd::Interrupted(e),
                None => {
                    return FeedEnd::Interrupted(AppError::StoreUnavailable(
                        "change feed ended".to_string(),
                    ))
                }
            }
        }
    }

    fn apply(&mut self, event: ChangeEvent) {
        self.cursor = event.sequence;
        let decoded = event
            .value
            .as_ref()
            .and_then(|document| self.decode(&event.key, document));

        match decoded {
            Some(item) => {
                self.items.insert(item.item_id.clone(), item);
            }
            // Deleted, or no longer readable
            None => {
                let removed = event.key.strip_prefix(&self.prefix).unwrap_or(&event.key);
                self.items.retain(|id, _| id.as_str() != removed);
            }
        }
    }

    fn decode(&self, key: &str, document: &Document) -> Option<WatchlistItem> {
        match WatchlistItem::decode(document) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Skipping unreadable watchlist item");
                None
            }
        }
    }

    /// Sends the current list unless it equals the previous emission
    async fn emit(&mut self) {
        let snapshot = WatchlistSnapshot::new(
            self.user_id.clone(),
            self.cursor,
            self.items.values().cloned().collect(),
        );
        if self.last_emitted.as_ref() == Some(&snapshot.items) {
            return;
        }

        self.last_emitted = Some(snapshot.items.clone());
        self.deliver(Ok(snapshot)).await;
    }

    async fn deliver(&mut self, item: AppResult<WatchlistSnapshot>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            sent = self.sender.send(item) => {
                if sent.is_err() {
                    // Receiver gone; treat like a cancel
                    self.cancel.cancel();
                }
            }
        }
    }
}
