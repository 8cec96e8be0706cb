//! Shared movie ratings and personal watchlists over a versioned document store.
//!
//! Writes go through [`services::ConflictRetryCoordinator`], which retries
//! read/compute/compare-and-swap cycles until the store accepts one. Watchlists
//! are also served as live snapshot feeds.

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
