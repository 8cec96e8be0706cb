use std::sync::Arc;
use tracing::instrument;

use crate::{
    error::AppResult,
    identity::IdentityProvider,
    models::{validate_rating, CatalogItem, ItemId, RatingAggregate, RatingUpdate},
    services::retry::{ConflictRetryCoordinator, Mutation},
    store::{DocumentCodec, DocumentKey, StoreClient, AGGREGATE_PREFIX},
};

/// Maintains the shared running-average record of every rated movie
///
/// Contributions are folded in with a compare-and-swap on the aggregate's
/// version: readers never block, racing writers re-read and retry. There is
/// no per-user bookkeeping, so the same user rating twice counts twice.
#[derive(Clone)]
pub struct RatingService {
    store: Arc<dyn StoreClient>,
    coordinator: ConflictRetryCoordinator,
    identity: Arc<dyn IdentityProvider>,
}

impl RatingService {
    pub fn new(
        store: Arc<dyn StoreClient>,
        coordinator: ConflictRetryCoordinator,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            store,
            coordinator,
            identity,
        }
    }

    /// Same service acting on behalf of another caller
    pub fn with_identity(&self, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    /// Adds one rating to the item's running average
    pub async fn apply_rating(&self, item_id: &ItemId, rating: f64) -> AppResult<RatingUpdate> {
        self.contribute(item_id, None, rating).await
    }

    /// Like [`RatingService::apply_rating`], also recording the catalog
    /// title and poster on the aggregate for listings
    pub async fn apply_rating_for(
        &self,
        item: &CatalogItem,
        rating: f64,
    ) -> AppResult<RatingUpdate> {
        self.contribute(&item.item_id, Some(item), rating).await
    }

    #[instrument(skip(self, item_id, details), fields(item_id = %item_id))]
    async fn contribute(
        &self,
        item_id: &ItemId,
        details: Option<&CatalogItem>,
        rating: f64,
    ) -> AppResult<RatingUpdate> {
        let user_id = self.identity.current_user_id()?;
        let rating = validate_rating(rating)?;
        let key = DocumentKey::Aggregate(item_id.clone());

        let committed = self
            .coordinator
            .execute::<RatingAggregate, _>(&key, |current| {
                let mut base = current
                    .map(|c| c.value.clone())
                    .unwrap_or_else(|| RatingAggregate::empty(item_id.clone()));
                if let Some(item) = details {
                    base.title = Some(item.title.clone());
                    // A hit without a poster keeps the one already recorded
                    if item.poster_url.is_some() {
                        base.poster_url = item.poster_url.clone();
                    }
                }
                Ok(Mutation::Put(base.with_contribution(rating)))
            })
            .await?;

        let mut aggregate = committed
            .value
            .unwrap_or_else(|| RatingAggregate::empty(item_id.clone()));
        aggregate.version = committed.version;

        tracing::info!(
            user_id = %user_id,
            rating = rating,
            average = aggregate.average_rating,
            total = aggregate.total_ratings,
            version = aggregate.version,
            "Rating applied"
        );

        Ok(RatingUpdate::from(&aggregate))
    }

    /// Current aggregate, or `None` if nobody has rated the item yet
    pub async fn aggregate(&self, item_id: &ItemId) -> AppResult<Option<RatingAggregate>> {
        let key = DocumentKey::Aggregate(item_id.clone());
        match self.store.get(&key).await? {
            Some(stored) => {
                let mut aggregate = RatingAggregate::decode(&stored.value)?;
                aggregate.version = stored.version;
                Ok(Some(aggregate))
            }
            None => Ok(None),
        }
    }

    /// Highest averages first; ties go to the more rated item, then the id
    #[instrument(skip(self))]
    pub async fn top_rated(&self, limit: usize) -> AppResult<Vec<RatingAggregate>> {
        let listing = self.store.list(AGGREGATE_PREFIX).await?;

        let mut aggregates = Vec::with_capacity(listing.documents.len());
        for (key, stored) in listing.documents {
            match RatingAggregate::decode(&stored.value) {
                Ok(mut aggregate) => {
                    aggregate.version = stored.version;
                    aggregates.push(aggregate);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable aggregate"),
            }
        }

        aggregates.sort_by(|a, b| {
            b.average_rating
                .total_cmp(&a.average_rating)
                .then_with(|| b.total_ratings.cmp(&a.total_ratings))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        aggregates.truncate(limit);

        Ok(aggregates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::identity::StaticIdentity;
    use crate::models::UserId;
    use crate::services::RetryPolicy;
    use crate::store::MemoryStore;

    fn service_with(store: Arc<MemoryStore>) -> RatingService {
        let coordinator = ConflictRetryCoordinator::new(store.clone(), RetryPolicy::immediate(5));
        let identity = Arc::new(StaticIdentity::user(UserId::new("alice").unwrap()));
        RatingService::new(store, coordinator, identity)
    }

    fn service() -> RatingService {
        service_with(Arc::new(MemoryStore::default()))
    }

    fn id(value: &str) -> ItemId {
        ItemId::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_first_rating_creates_aggregate() {
        let service = service();
        let update = service.apply_rating(&id("550"), 4.0).await.unwrap();

        assert_eq!(update.average_rating, 4.0);
        assert_eq!(update.total_ratings, 1);
        assert_eq!(update.version, 1);
    }

    #[tokio::test]
    async fn test_sequential_ratings_average() {
        let service = service();
        service.apply_rating(&id("42"), 5.0).await.unwrap();
        service.apply_rating(&id("42"), 3.0).await.unwrap();
        let update = service.apply_rating(&id("42"), 4.0).await.unwrap();

        assert!((update.average_rating - 4.0).abs() < 1e-9);
        assert_eq!(update.total_ratings, 3);
        assert_eq!(update.version, 3);

        let stored = service.aggregate(&id("42")).await.unwrap().unwrap();
        assert_eq!(stored.total_ratings, 3);
        assert_eq!(stored.version, 3);
    }

    #[tokio::test]
    async fn test_same_user_rating_twice_counts_twice() {
        let service = service();
        service.apply_rating(&id("7"), 5.0).await.unwrap();
        let update = service.apply_rating(&id("7"), 1.0).await.unwrap();

        assert_eq!(update.total_ratings, 2);
        assert!((update.average_rating - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_rating_leaves_store_untouched() {
        let service = service();
        let err = service.apply_rating(&id("7"), 6.0).await.unwrap_err();

        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(service.aggregate(&id("7")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_anonymous_caller_is_rejected() {
        let service = service().with_identity(Arc::new(StaticIdentity::anonymous()));
        let err = service.apply_rating(&id("7"), 3.0).await.unwrap_err();
        assert_eq!(err, AppError::Unauthenticated);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_aggregate_unchanged() {
        let store = Arc::new(MemoryStore::default());
        let service = service_with(store.clone());
        service.apply_rating(&id("9"), 2.0).await.unwrap();

        store.fail_next_commits(5);
        let err = service.apply_rating(&id("9"), 5.0).await.unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));

        let aggregate = service.aggregate(&id("9")).await.unwrap().unwrap();
        assert_eq!(aggregate.total_ratings, 1);
        assert_eq!(aggregate.average_rating, 2.0);
        assert_eq!(aggregate.version, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::default());
        let service = service_with(store.clone());

        store.fail_next_commits(2);
        let update = service.apply_rating(&id("9"), 5.0).await.unwrap();
        assert_eq!(update.total_ratings, 1);
    }

    #[tokio::test]
    async fn test_apply_rating_for_records_details() {
        let service = service();
        let item = CatalogItem {
            item_id: id("603"),
            title: "The Matrix".to_string(),
            poster_url: Some("https://image.tmdb.org/t/p/w500/m.jpg".to_string()),
        };
        service.apply_rating_for(&item, 5.0).await.unwrap();

        let aggregate = service.aggregate(&id("603")).await.unwrap().unwrap();
        assert_eq!(aggregate.title.as_deref(), Some("The Matrix"));
        assert_eq!(aggregate.poster_url, item.poster_url);

        // A bare contribution keeps the recorded title
        service.apply_rating(&id("603"), 3.0).await.unwrap();
        let aggregate = service.aggregate(&id("603")).await.unwrap().unwrap();
        assert_eq!(aggregate.title.as_deref(), Some("The Matrix"));
        assert_eq!(aggregate.total_ratings, 2);
    }

    #[tokio::test]
    async fn test_hit_without_poster_keeps_recorded_poster() {
        let service = service();
        let poster = Some("https://image.tmdb.org/t/p/w500/m.jpg".to_string());
        let with_poster = CatalogItem {
            item_id: id("603"),
            title: "The Matrix".to_string(),
            poster_url: poster.clone(),
        };
        service.apply_rating_for(&with_poster, 5.0).await.unwrap();

        let without_poster = CatalogItem {
            poster_url: None,
            title: "The Matrix (1999)".to_string(),
            ..with_poster
        };
        service.apply_rating_for(&without_poster, 4.0).await.unwrap();

        let aggregate = service.aggregate(&id("603")).await.unwrap().unwrap();
        assert_eq!(aggregate.title.as_deref(), Some("The Matrix (1999)"));
        assert_eq!(aggregate.poster_url, poster);
        assert_eq!(aggregate.total_ratings, 2);
    }

    #[tokio::test]
    async fn test_top_rated_ordering_and_limit() {
        let service = service();
        service.apply_rating(&id("a"), 3.0).await.unwrap();
        service.apply_rating(&id("b"), 5.0).await.unwrap();
        service.apply_rating(&id("c"), 4.0).await.unwrap();
        service.apply_rating(&id("c"), 4.0).await.unwrap();
        service.apply_rating(&id("d"), 4.0).await.unwrap();

        let top = service.top_rated(3).await.unwrap();
        let ids: Vec<&str> = top.iter().map(|a| a.item_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }
}
