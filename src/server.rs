//! HTTP server and routes.

mod handlers;
mod state;

pub use handlers::format_size;
pub use state::{AppState, HttpDownloader};

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let book_routes = Router::new()
        .route("/", get(handlers::list_books))
        .route(
            "/{slug}",
            get(handlers::get_book).delete(handlers::delete_book),
        )
        .route("/{slug}/chapters", get(handlers::get_chapters))
        .route("/{slug}/hadiths", get(handlers::get_hadiths))
        .route("/{slug}/download", post(handlers::start_download));

    let download_routes = Router::new()
        .route("/batch", post(handlers::batch_download))
        .route("/retry", post(handlers::retry_downloads))
        .route("/update", post(handlers::update_books))
        .route(
            "/current",
            get(handlers::current_download).delete(handlers::cancel_download),
        );

    let api_routes = Router::new()
        .route("/queue", get(handlers::download_queue))
        .route(
            "/storage",
            get(handlers::storage_info).delete(handlers::clear_storage),
        );

    Router::new()
        .nest("/api/books", book_routes)
        .nest("/api/downloads", download_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
