//! Transactional document store contract
//!
//! The services only ever talk to a [`StoreClient`]: versioned reads,
//! compare-and-swap writes, prefix listings and a per-prefix change feed.
//! [`MemoryStore`] is the in-process implementation shipped with the crate.

use futures::stream::BoxStream;
use std::fmt::Display;

use crate::{
    error::AppResult,
    models::{ItemId, UserId},
};

pub mod document;
pub mod memory;

pub use document::{Document, DocumentCodec};
pub use memory::MemoryStore;

/// Prefix under which every rating aggregate lives
pub const AGGREGATE_PREFIX: &str = "movies/";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentKey {
    /// Global running average for one catalog item
    Aggregate(ItemId),
    /// One saved item in a user's watchlist
    WatchlistItem { user_id: UserId, item_id: ItemId },
}

impl DocumentKey {
    /// Prefix covering every watchlist item of one user
    pub fn watchlist_prefix(user_id: &UserId) -> String {
        format!("users/{}/watchlist/", user_id)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentKey::Aggregate(item_id) => write!(f, "{}{}", AGGREGATE_PREFIX, item_id),
            DocumentKey::WatchlistItem { user_id, item_id } => {
                write!(f, "{}{}", Self::watchlist_prefix(user_id), item_id)
            }
        }
    }
}

/// A value together with the store-assigned version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Conditional write payload
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Document),
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The write landed; `sequence` is its position in the global change order
    Committed { version: u64, sequence: u64 },
    /// The document is no longer at the expected version (0 = absent)
    VersionConflict { actual: u64 },
}

/// Every document under a prefix, consistent with change sequence `as_of`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Listing {
    pub documents: Vec<(String, Versioned<Document>)>,
    pub as_of: u64,
}

/// One committed write as seen by a change feed subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: String,
    /// `None` when the write deleted the document
    pub value: Option<Document>,
    pub version: u64,
    pub sequence: u64,
}

/// Ordered change events; an `Err` item means the feed was interrupted
pub type ChangeFeed = BoxStream<'static, AppResult<ChangeEvent>>;

/// Contract the services require from the document store.
///
/// Versions start at 1 on creation and grow by exactly one per committed
/// write, deletes included. They never repeat for a key: a document created
/// again after a delete continues from the deleted version. An absent
/// document reads as no value and is matched by expected version 0, so a
/// writer holding the version of an earlier incarnation always conflicts.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync {
    async fn get(&self, key: &DocumentKey) -> AppResult<Option<Versioned<Document>>>;

    async fn commit_if_version(
        &self,
        key: &DocumentKey,
        op: WriteOp,
        expected_version: u64,
    ) -> AppResult<CommitOutcome>;

    async fn list(&self, prefix: &str) -> AppResult<Listing>;

    /// Subscribe to changes of keys starting with `prefix`.
    ///
    /// Only changes committed after the call are delivered; pair with
    /// [`StoreClient::list`] and discard events at or below `as_of`.
    async fn subscribe(&self, prefix: &str) -> AppResult<ChangeFeed>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_display_aggregate() {
        let key = DocumentKey::Aggregate(ItemId::new("27205").unwrap());
        assert_eq!(format!("{}", key), "movies/27205");
    }

    #[test]
    fn test_document_key_display_watchlist_item() {
        let key = DocumentKey::WatchlistItem {
            user_id: UserId::new("u1").unwrap(),
            item_id: ItemId::new("27205").unwrap(),
        };
        assert_eq!(format!("{}", key), "users/u1/watchlist/27205");
        assert!(key
            .to_string()
            .starts_with(&DocumentKey::watchlist_prefix(&UserId::new("u1").unwrap())));
    }

    #[test]
    fn test_watchlist_prefix_does_not_cover_other_users() {
        let key = DocumentKey::WatchlistItem {
            user_id: UserId::new("u10").unwrap(),
            item_id: ItemId::new("1").unwrap(),
        };
        let prefix = DocumentKey::watchlist_prefix(&UserId::new("u1").unwrap());
        assert!(!key.to_string().starts_with(&prefix));
    }
}
