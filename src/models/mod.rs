mod catalog;
mod rating;
mod watchlist;

pub use catalog::{CatalogItem, ItemId, UserId};
pub use rating::{validate_rating, RatingAggregate, RatingUpdate, MAX_RATING, MIN_RATING};
pub use watchlist::{
    validate_personal_rating, NewWatchlistItem, WatchlistItem, WatchlistSnapshot, UNRATED,
};
