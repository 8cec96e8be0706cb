use serde::{Deserialize, Serialize};

use super::ItemId;
use crate::{
    error::{AppError, AppResult},
    store::{Document, DocumentCodec},
};

pub const MIN_RATING: f64 = 1.0;
pub const MAX_RATING: f64 = 5.0;

/// Global running average for one catalog item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingAggregate {
    pub item_id: ItemId,
    pub title: Option<String>,
    pub poster_url: Option<String>,
    pub average_rating: f64,
    pub total_ratings: u64,
    /// Store version; not part of the document body
    #[serde(default)]
    pub version: u64,
}

/// Result of a successful contribution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingUpdate {
    pub item_id: ItemId,
    pub average_rating: f64,
    pub total_ratings: u64,
    pub version: u64,
}

impl RatingAggregate {
    /// State of an item nobody has rated yet
    pub fn empty(item_id: ItemId) -> Self {
        Self {
            item_id,
            title: None,
            poster_url: None,
            average_rating: 0.0,
            total_ratings: 0,
            version: 0,
        }
    }

    /// Folds one more contribution into the running mean
    pub fn with_contribution(&self, rating: f64) -> Self {
        let total = self.total_ratings + 1;
        let average = (self.average_rating * self.total_ratings as f64 + rating) / total as f64;

        Self {
            average_rating: average,
            total_ratings: total,
            ..self.clone()
        }
    }
}

/// Accepts finite ratings within [1, 5]
pub fn validate_rating(rating: f64) -> AppResult<f64> {
    if !rating.is_finite() || !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(AppError::InvalidInput(format!(
            "rating must be between {} and {}, got {}",
            MIN_RATING, MAX_RATING, rating
        )));
    }
    Ok(rating)
}

impl DocumentCodec for RatingAggregate {
    fn encode(&self) -> Document {
        Document::new()
            .with("itemId", self.item_id.as_str())
            .with("title", self.title.clone())
            .with("posterUrl", self.poster_url.clone())
            .with("avgRating", self.average_rating)
            .with("totalRatings", self.total_ratings)
    }

    fn decode(document: &Document) -> AppResult<Self> {
        let item_id = ItemId::new(document.str_field("itemId")?)
            .map_err(|e| AppError::MalformedDocument(e.to_string()))?;

        Ok(Self {
            item_id,
            title: document.opt_str_field("title")?.map(str::to_string),
            poster_url: document.opt_str_field("posterUrl")?.map(str::to_string),
            average_rating: document.f64_field("avgRating")?,
            total_ratings: document.u64_field("totalRatings")?,
            version: 0,
        })
    }
}

impl From<&RatingAggregate> for RatingUpdate {
    fn from(aggregate: &RatingAggregate) -> Self {
        Self {
            item_id: aggregate.item_id.clone(),
            average_rating: aggregate.average_rating,
            total_ratings: aggregate.total_ratings,
            version: aggregate.version,
        }
    }
}
