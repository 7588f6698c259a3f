pub mod comments;
pub mod listings;
pub mod posts;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// The full HTTP surface with request tracing.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(posts::router())
        .merge(comments::router())
        .merge(listings::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
