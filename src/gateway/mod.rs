mod handler;

pub use handler::{GatewayState, handle_health, handle_keys, handle_llm};

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub fn router(state: Arc<GatewayState>) -> Router {
    let api_routes = Router::new()
        .route("/api/llm", post(handle_llm))
        .route("/api/keys", get(handle_keys))
        .with_state(state);

    Router::new()
        .route("/health", get(handle_health))
        .merge(api_routes)
}
