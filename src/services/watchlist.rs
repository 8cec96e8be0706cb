use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

use crate::{
    error::{AppError, AppResult},
    identity::{require_user, IdentityProvider},
    models::{
        validate_personal_rating, ItemId, NewWatchlistItem, UserId, WatchlistItem,
        WatchlistSnapshot,
    },
    services::{
        retry::{ConflictRetryCoordinator, Mutation},
        subscription::WatchlistSubscription,
    },
    store::{Document, DocumentCodec, DocumentKey, StoreClient},
};

/// Owns every user's saved-item list and its live feed
///
/// Items are keyed by (user, item); users never contend with each other.
/// Every operation checks that the caller is the list's owner.
#[derive(Clone)]
pub struct WatchlistService {
    store: Arc<dyn StoreClient>,
    coordinator: ConflictRetryCoordinator,
    identity: Arc<dyn IdentityProvider>,
    subscription_buffer: usize,
}

impl WatchlistService {
    pub fn new(
        store: Arc<dyn StoreClient>,
        coordinator: ConflictRetryCoordinator,
        identity: Arc<dyn IdentityProvider>,
        subscription_buffer: usize,
    ) -> Self {
        Self {
            store,
            coordinator,
            identity,
            subscription_buffer,
        }
    }

    /// Same service acting on behalf of another caller
    pub fn with_identity(&self, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    fn key(user_id: &UserId, item_id: &ItemId) -> DocumentKey {
        DocumentKey::WatchlistItem {
            user_id: user_id.clone(),
            item_id: item_id.clone(),
        }
    }

    /// Saves an item, or merges the payload into the saved one
    #[instrument(skip(self, user_id, item), fields(user_id = %user_id, item_id = %item.item_id))]
    pub async fn add_item(
        &self,
        user_id: &UserId,
        item: NewWatchlistItem,
    ) -> AppResult<WatchlistItem> {
        require_user(self.identity.as_ref(), user_id)?;
        item.validate()?;

        let key = Self::key(user_id, &item.item_id);
        let now = Utc::now();

        let committed = self
            .coordinator
            .execute::<WatchlistItem, _>(&key, |current| {
                let merged = item.merge_into(current.map(|c| &c.value), now);
                if current.is_some_and(|c| c.value == merged) {
                    return Ok(Mutation::Keep);
                }
                Ok(Mutation::Put(merged))
            })
            .await?;

        tracing::info!(
            written = committed.written,
            version = committed.version,
            "Watchlist item saved"
        );

        committed
            .value
            .ok_or_else(|| AppError::Internal(format!("{} vanished after upsert", key)))
    }

    /// Changes only the personal rating of an existing item
    #[instrument(skip(self, user_id, item_id), fields(user_id = %user_id, item_id = %item_id))]
    pub async fn update_item(
        &self,
        user_id: &UserId,
        item_id: &ItemId,
        rating: u8,
    ) -> AppResult<WatchlistItem> {
        require_user(self.identity.as_ref(), user_id)?;
        let rating = validate_personal_rating(rating)?;
        let key = Self::key(user_id, item_id);

        let committed = self
            .coordinator
            .execute::<WatchlistItem, _>(&key, |current| {
                let Some(current) = current else {
                    return Err(AppError::NotFound(format!(
                        "{} is not in the watchlist of {}",
                        item_id, user_id
                    )));
                };
                if current.value.personal_rating == rating {
                    return Ok(Mutation::Keep);
                }
                Ok(Mutation::Put(WatchlistItem {
                    personal_rating: rating,
                    ..current.value.clone()
                }))
            })
            .await?;

        tracing::info!(rating = rating, version = committed.version, "Watchlist rating updated");

        committed
            .value
            .ok_or_else(|| AppError::Internal(format!("{} vanished after update", key)))
    }

    /// Deletes an item; returns false if it was not there
    ///
    /// Works on the raw document, so an unreadable item can still be removed.
    #[instrument(skip(self, user_id, item_id), fields(user_id = %user_id, item_id = %item_id))]
    pub async fn remove_item(&self, user_id: &UserId, item_id: &ItemId) -> AppResult<bool> {
        require_user(self.identity.as_ref(), user_id)?;
        let key = Self::key(user_id, item_id);

        let committed = self
            .coordinator
            .execute::<Document, _>(&key, |_| Ok(Mutation::Delete))
            .await?;

        tracing::info!(removed = committed.written, "Watchlist item removed");
        Ok(committed.written)
    }

    pub async fn get_item(&self, user_id: &UserId, item_id: &ItemId) -> AppResult<WatchlistItem> {
        require_user(self.identity.as_ref(), user_id)?;
        let key = Self::key(user_id, item_id);

        let stored = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("{} is not in the watchlist of {}", item_id, user_id))
            })?;
        WatchlistItem::decode(&stored.value)
    }

    /// One-shot snapshot of the whole list
    pub async fn list_items(&self, user_id: &UserId) -> AppResult<WatchlistSnapshot> {
        require_user(self.identity.as_ref(), user_id)?;
        let listing = self
            .store
            .list(&DocumentKey::watchlist_prefix(user_id))
            .await?;

        let mut items = Vec::with_capacity(listing.documents.len());
        for (key, stored) in &listing.documents {
            match WatchlistItem::decode(&stored.value) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable watchlist item")
                }
            }
        }

        Ok(WatchlistSnapshot::new(user_id.clone(), listing.as_of, items))
    }

    /// Live feed of full snapshots, starting with the current state
    pub fn subscribe(&self, user_id: &UserId) -> AppResult<WatchlistSubscription> {
        require_user(self.identity.as_ref(), user_id)?;
        tracing::info!(user_id = %user_id, "Watchlist subscription opened");

        Ok(WatchlistSubscription::spawn(
            self.store.clone(),
            user_id.clone(),
            self.coordinator.policy().clone(),
            self.subscription_buffer,
        ))
    }
}
