use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::middleware::{make_span_with_request_id, request_id_middleware};

use super::handlers;
use super::AppState;

/// Creates the application router with all routes and layers
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
        // Outermost, so the trace span can see the request id
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
}

/// API routes under /api/v1
fn api_routes() -> Router<AppState> {
    Router::new()
        // Ratings
        .route("/movies/top", get(handlers::top_rated))
        .route("/movies/:item_id/rating", get(handlers::get_rating))
        .route("/movies/:item_id/ratings", post(handlers::apply_rating))
        // Watchlist
        .route("/watchlist", get(handlers::list_watchlist))
        .route("/watchlist/stream", get(handlers::stream_watchlist))
        .route(
            "/watchlist/:item_id",
            get(handlers::get_watchlist_item)
                .put(handlers::add_watchlist_item)
                .patch(handlers::update_watchlist_item)
                .delete(handlers::remove_watchlist_item),
        )
}
