use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{CatalogItem, ItemId, UserId};
use crate::{
    error::{AppError, AppResult},
    store::{Document, DocumentCodec},
};

/// Personal rating meaning "not rated yet"
pub const UNRATED: u8 = 0;

/// A movie saved in one user's watchlist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchlistItem {
    pub item_id: ItemId,
    pub title: String,
    pub poster_url: Option<String>,
    /// 1-5, or 0 when unrated
    pub personal_rating: u8,
    pub added_at: DateTime<Utc>,
}

/// Payload for adding (or re-adding) an item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewWatchlistItem {
    pub item_id: ItemId,
    pub title: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    /// Leaves an existing rating untouched when absent
    #[serde(default)]
    pub personal_rating: Option<u8>,
}

/// Full view of a user's watchlist at one point of the change order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchlistSnapshot {
    pub user_id: UserId,
    pub sequence: u64,
    pub items: Vec<WatchlistItem>,
}

impl From<CatalogItem> for NewWatchlistItem {
    fn from(item: CatalogItem) -> Self {
        Self {
            item_id: item.item_id,
            title: item.title,
            poster_url: item.poster_url,
            personal_rating: None,
        }
    }
}

/// Accepts 0 (clear) through 5
pub fn validate_personal_rating(rating: u8) -> AppResult<u8> {
    if rating > 5 {
        return Err(AppError::InvalidInput(format!(
            "personal rating must be between 0 and 5, got {}",
            rating
        )));
    }
    Ok(rating)
}

impl NewWatchlistItem {
    pub fn validate(&self) -> AppResult<()> {
        if self.title.trim().is_empty() {
            return Err(AppError::InvalidInput("title must not be empty".to_string()));
        }
        if let Some(rating) = self.personal_rating {
            validate_personal_rating(rating)?;
        }
        Ok(())
    }

    /// Upsert: a fresh item, or `existing` with this payload merged in.
    ///
    /// `added_at` survives re-adds, and so does the rating unless the
    /// payload carries one.
    pub fn merge_into(
        &self,
        existing: Option<&WatchlistItem>,
        now: DateTime<Utc>,
    ) -> WatchlistItem {
        match existing {
            Some(current) => WatchlistItem {
                item_id: current.item_id.clone(),
                title: self.title.clone(),
                poster_url: self.poster_url.clone(),
                personal_rating: self.personal_rating.unwrap_or(current.personal_rating),
                added_at: current.added_at,
            },
            None => WatchlistItem {
                item_id: self.item_id.clone(),
                title: self.title.clone(),
                poster_url: self.poster_url.clone(),
                personal_rating: self.personal_rating.unwrap_or(UNRATED),
                added_at: now,
            },
        }
    }
}

impl WatchlistSnapshot {
    /// Orders items oldest first, ties broken by id
    pub fn new(user_id: UserId, sequence: u64, mut items: Vec<WatchlistItem>) -> Self {
        items.sort_by(|a, b| {
            a.added_at
                .cmp(&b.added_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        Self {
            user_id,
            sequence,
            items,
        }
    }
}

impl DocumentCodec for WatchlistItem {
    fn encode(&self) -> Document {
        Document::new()
            .with("itemId", self.item_id.as_str())
            .with("title", self.title.as_str())
            .with("posterUrl", self.poster_url.clone())
            .with("rating", u64::from(self.personal_rating))
            .with(
                "addedAt",
                self.added_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )
    }

    fn decode(document: &Document) -> AppResult<Self> {
        let item_id = ItemId::new(document.str_field("itemId")?)
            .map_err(|e| AppError::MalformedDocument(e.to_string()))?;
        let rating = document.u64_field("rating")?;
        let personal_rating = u8::try_from(rating)
            .ok()
            .filter(|r| *r <= 5)
            .ok_or_else(|| {
                AppError::MalformedDocument(format!("rating out of range: {}", rating))
            })?;

        Ok(Self {
            item_id,
            title: document.str_field("title")?.to_string(),
            poster_url: document.opt_str_field("posterUrl")?.map(str::to_string),
            personal_rating,
            added_at: document.timestamp_field("addedAt")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload(rating: Option<u8>) -> NewWatchlistItem {
        NewWatchlistItem {
            item_id: ItemId::new("155").unwrap(),
            title: "The Dark Knight".to_string(),
            poster_url: Some("https://image.tmdb.org/t/p/w500/dk.jpg".to_string()),
            personal_rating: rating,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_merge_creates_unrated_item() {
        let item = payload(None).merge_into(None, at(100));
        assert_eq!(item.personal_rating, UNRATED);
        assert_eq!(item.added_at, at(100));
    }

    #[test]
    fn test_merge_keeps_added_at_and_rating() {
        let existing = payload(Some(4)).merge_into(None, at(100));
        let merged = payload(None).merge_into(Some(&existing), at(200));

        assert_eq!(merged.added_at, at(100));
        assert_eq!(merged.personal_rating, 4);
        assert_eq!(merged, existing);
    }

    #[test]
    fn test_merge_applies_payload_rating() {
        let existing = payload(Some(4)).merge_into(None, at(100));
        let merged = payload(Some(2)).merge_into(Some(&existing), at(200));
        assert_eq!(merged.personal_rating, 2);
    }

    #[test]
    fn test_validate() {
        assert!(payload(Some(5)).validate().is_ok());
        assert!(payload(Some(6)).validate().is_err());

        let mut blank = payload(None);
        blank.title = "  ".to_string();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_document_roundtrip_preserves_timestamp() {
        let item = payload(Some(3)).merge_into(None, Utc::now());
        let decoded = WatchlistItem::decode(&item.encode()).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_decode_rejects_out_of_range_rating() {
        let doc = payload(None)
            .merge_into(None, at(0))
            .encode()
            .with("rating", 9u64);
        assert!(matches!(
            WatchlistItem::decode(&doc),
            Err(AppError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_snapshot_orders_by_added_at() {
        let mut first = payload(None).merge_into(None, at(10));
        first.item_id = ItemId::new("b").unwrap();
        let mut second = payload(None).merge_into(None, at(20));
        second.item_id = ItemId::new("a").unwrap();

        let snapshot = WatchlistSnapshot::new(
            UserId::new("u1").unwrap(),
            7,
            vec![second.clone(), first.clone()],
        );
        assert_eq!(snapshot.items, vec![first, second]);
    }
}
