use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    error::{AppError, AppResult},
    identity::IdentityProvider,
    models::{
        CatalogItem, ItemId, NewWatchlistItem, RatingAggregate, RatingUpdate, WatchlistItem,
        WatchlistSnapshot,
    },
};

use super::{identity::HeaderIdentity, AppState};

// Request types

#[derive(Debug, Deserialize)]
pub struct TopRatedQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ApplyRatingRequest {
    pub rating: f64,
    /// When present the aggregate also records the catalog display fields
    pub title: Option<String>,
    pub poster_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddWatchlistItemRequest {
    pub title: String,
    pub poster_url: Option<String>,
    pub personal_rating: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWatchlistItemRequest {
    pub personal_rating: u8,
}

// Handlers

pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

pub async fn top_rated(
    State(state): State<AppState>,
    Query(query): Query<TopRatedQuery>,
) -> AppResult<Json<Vec<RatingAggregate>>> {
    let limit = query.limit.unwrap_or(state.top_rated_limit);
    Ok(Json(state.ratings.top_rated(limit).await?))
}

pub async fn get_rating(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> AppResult<Json<RatingAggregate>> {
    let item_id = ItemId::new(item_id)?;
    state
        .ratings
        .aggregate(&item_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{} has no ratings", item_id)))
}

pub async fn apply_rating(
    State(state): State<AppState>,
    caller: HeaderIdentity,
    Path(item_id): Path<String>,
    Json(payload): Json<ApplyRatingRequest>,
) -> AppResult<Json<RatingUpdate>> {
    let item_id = ItemId::new(item_id)?;
    let ratings = state.ratings.with_identity(Arc::new(caller));

    let update = match payload.title {
        Some(title) => {
            let item = CatalogItem {
                item_id,
                title,
                poster_url: payload.poster_url,
            };
            ratings.apply_rating_for(&item, payload.rating).await?
        }
        None => ratings.apply_rating(&item_id, payload.rating).await?,
    };

    Ok(Json(update))
}

pub async fn list_watchlist(
    State(state): State<AppState>,
    caller: HeaderIdentity,
) -> AppResult<Json<WatchlistSnapshot>> {
    let user_id = caller.current_user_id()?;
    let watchlist = state.watchlist.with_identity(Arc::new(caller));
    Ok(Json(watchlist.list_items(&user_id).await?))
}

/// Server-sent events: one `snapshot` event per emission, an `error` event
/// before the feed gives up
pub async fn stream_watchlist(
    State(state): State<AppState>,
    caller: HeaderIdentity,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let user_id = caller.current_user_id()?;
    let subscription = state
        .watchlist
        .with_identity(Arc::new(caller))
        .subscribe(&user_id)?;

    let events = subscription.map(|emission| match emission {
        Ok(snapshot) => Event::default().event("snapshot").json_data(&snapshot),
        Err(e) => Ok(Event::default().event("error").data(e.to_string())),
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn get_watchlist_item(
    State(state): State<AppState>,
    caller: HeaderIdentity,
    Path(item_id): Path<String>,
) -> AppResult<Json<WatchlistItem>> {
    let item_id = ItemId::new(item_id)?;
    let user_id = caller.current_user_id()?;
    let watchlist = state.watchlist.with_identity(Arc::new(caller));
    Ok(Json(watchlist.get_item(&user_id, &item_id).await?))
}

pub async fn add_watchlist_item(
    State(state): State<AppState>,
    caller: HeaderIdentity,
    Path(item_id): Path<String>,
    Json(payload): Json<AddWatchlistItemRequest>,
) -> AppResult<Json<WatchlistItem>> {
    let item_id = ItemId::new(item_id)?;
    let user_id = caller.current_user_id()?;
    let watchlist = state.watchlist.with_identity(Arc::new(caller));

    let item = NewWatchlistItem {
        item_id,
        title: payload.title,
        poster_url: payload.poster_url,
        personal_rating: payload.personal_rating,
    };
    Ok(Json(watchlist.add_item(&user_id, item).await?))
}

pub async fn update_watchlist_item(
    State(state): State<AppState>,
    caller: HeaderIdentity,
    Path(item_id): Path<String>,
    Json(payload): Json<UpdateWatchlistItemRequest>,
) -> AppResult<Json<WatchlistItem>> {
    let item_id = ItemId::new(item_id)?;
    let user_id = caller.current_user_id()?;
    let watchlist = state.watchlist.with_identity(Arc::new(caller));
    Ok(Json(
        watchlist
            .update_item(&user_id, &item_id, payload.personal_rating)
            .await?,
    ))
}

pub async fn remove_watchlist_item(
    State(state): State<AppState>,
    caller: HeaderIdentity,
    Path(item_id): Path<String>,
) -> AppResult<StatusCode> {
    let item_id = ItemId::new(item_id)?;
    let user_id = caller.current_user_id()?;
    let watchlist = state.watchlist.with_identity(Arc::new(caller));
    watchlist.remove_item(&user_id, &item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
