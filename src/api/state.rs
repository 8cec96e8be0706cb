use std::sync::Arc;

use crate::{
    config::Config,
    identity::StaticIdentity,
    services::{ConflictRetryCoordinator, RatingService, WatchlistService},
    store::StoreClient,
};

/// Shared application state
///
/// The services hold an anonymous identity; handlers rebind them to the
/// caller of each request.
#[derive(Clone)]
pub struct AppState {
    pub ratings: RatingService,
    pub watchlist: WatchlistService,
    pub top_rated_limit: usize,
}

impl AppState {
    /// Wires both services over one store with the configured retry policy
    pub fn new(store: Arc<dyn StoreClient>, config: &Config) -> Self {
        let coordinator = ConflictRetryCoordinator::new(store.clone(), config.retry_policy());
        let anonymous = Arc::new(StaticIdentity::anonymous());

        Self {
            ratings: RatingService::new(store.clone(), coordinator.clone(), anonymous.clone()),
            watchlist: WatchlistService::new(
                store,
                coordinator,
                anonymous,
                config.subscription_buffer,
            ),
            top_rated_limit: config.top_rated_limit,
        }
    }
}
