//! API layer -- axum routes and handlers over the controller.

mod routes;
pub mod state;

use axum::http::Uri;
use axum::Router;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::error::TestError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback(uri: Uri) -> TestError {
    TestError::not_found(format!("no route for {}", uri.path()))
}
