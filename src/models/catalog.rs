use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::error::{AppError, AppResult};

/// Stable catalog identifier for a movie (e.g. a TMDB id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

/// Opaque user id handed out by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

/// Ids end up inside document keys, so they must be non-empty and slash-free
fn validate_segment(kind: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{} must not be empty", kind)));
    }
    if value.contains('/') {
        return Err(AppError::InvalidInput(format!(
            "{} must not contain '/': {}",
            kind, value
        )));
    }
    Ok(())
}

impl ItemId {
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        validate_segment("item id", &value)?;
        Ok(Self(value))
    }

    /// Derives an id from a title for catalog entries without one.
    ///
    /// Whitespace runs collapse to `_` and the result is lowercased, so
    /// "The  Dark Knight" becomes "the_dark_knight".
    pub fn from_title(title: &str) -> AppResult<Self> {
        let slug = title
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .replace('/', "_")
            .to_lowercase();
        Self::new(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl UserId {
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        validate_segment("user id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ItemId {
    type Error = AppError;

    fn try_from(value: String) -> AppResult<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for UserId {
    type Error = AppError;

    fn try_from(value: String) -> AppResult<Self> {
        Self::new(value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// A search hit from the catalog lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogItem {
    pub item_id: ItemId,
    pub title: String,
    pub poster_url: Option<String>,
}

impl CatalogItem {
    /// Builds an entry from a title alone, deriving the id from it
    pub fn from_title(title: impl Into<String>, poster_url: Option<String>) -> AppResult<Self> {
        let title = title.into();
        Ok(Self {
            item_id: ItemId::from_title(&title)?,
            title,
            poster_url,
        })
    }
}
