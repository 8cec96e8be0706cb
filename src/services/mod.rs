pub mod ratings;
pub mod retry;
pub mod subscription;
pub mod watchlist;

pub use ratings::RatingService;
pub use retry::{Committed, ConflictRetryCoordinator, Mutation, RetryPolicy};
pub use subscription::WatchlistSubscription;
pub use watchlist::WatchlistService;
