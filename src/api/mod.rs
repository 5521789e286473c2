//! HTTP layer: router, handlers, error surface.

pub mod errors;
pub mod handlers;

pub use errors::ApiError;
pub use handlers::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::get_stats))
        .route("/metrics", get(handlers::get_metrics))
        .route(
            "/api/archives",
            get(handlers::list_archives).post(handlers::upload_batch),
        )
        .route("/api/archives/stream", put(handlers::upload_stream))
        .route("/api/archives/:id", get(handlers::get_archive))
        .route("/api/archives/:id/download", get(handlers::download))
        .route(
            "/api/archives/:id/files/:index",
            get(handlers::download_entry),
        )
        .route("/api/archives/:id/parts", get(handlers::get_parts))
        .route(
            "/api/archives/:id/parts/:index/refresh",
            post(handlers::refresh_part),
        )
        .route(
            "/api/archives/:id/parts/:index/relay",
            get(handlers::relay_part),
        )
        .route("/api/archives/:id/trash", post(handlers::trash_archive))
        .route("/api/archives/:id/restore", post(handlers::restore_archive))
        .route("/api/archives/:id/purge", post(handlers::purge_archive))
        .route("/api/archives/:id/move", post(handlers::move_archive))
        .route("/api/archives/:id/rename", post(handlers::rename_archive))
        .route("/api/archives/:id/priority", post(handlers::set_priority))
        .layer(TraceLayer::new_for_http())
        // Upload sizes are governed by quota and disk limits, not a fixed
        // body cap (the axum default of 2 MB is far too small for archives).
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
