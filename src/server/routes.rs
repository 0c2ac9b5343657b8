//! Route definitions

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};

use super::handlers::{
    cancel_request, get_position, get_request, health, list_models, load_model, queue_stats,
    submit_request, unload_model, AppState,
};
use crate::lifecycle::ModelLoader;

/// Create the control-plane router
pub fn api_routes<L: ModelLoader>() -> Router<Arc<AppState<L>>> {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Admission queue
        .route("/v1/requests", post(submit_request::<L>))
        .route(
            "/v1/requests/:id",
            get(get_request::<L>).delete(cancel_request::<L>),
        )
        .route("/v1/requests/:id/position", get(get_position::<L>))
        .route("/v1/queue/stats", get(queue_stats::<L>))
        // Model pool
        .route("/v1/models", get(list_models::<L>))
        .route("/v1/models/:name", delete(unload_model::<L>))
        .route("/v1/models/:name/load", post(load_model::<L>))
}
