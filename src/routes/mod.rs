//! Route modules

pub mod health;
pub mod upload;

use axum::Router;

use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/uploads", upload::router())
        .with_state(state)
}
