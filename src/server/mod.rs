//! HTTP control plane
//!
//! Exposes the admission queue and the model pool over a small REST API.

mod handlers;
mod routes;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::lifecycle::ModelLoader;

pub use handlers::{
    ApiError, AppState, CancelResponse, ModelActionResponse, PositionResponse, SubmitRequest,
    SubmitResponse, UnloadResponse,
};
pub use routes::api_routes;

/// Build the router with the configured middleware
pub fn router<L: ModelLoader>(state: Arc<AppState<L>>, config: &ServerConfig) -> Router {
    let mut app = Router::new().merge(api_routes::<L>());

    if config.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }
    if config.request_logging {
        app = app.layer(TraceLayer::new_for_http());
    }

    app.with_state(state)
}

/// Serve the control plane until `shutdown` resolves
pub async fn start<L, F>(state: Arc<AppState<L>>, config: ServerConfig, shutdown: F) -> Result<()>
where
    L: ModelLoader,
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, &config);

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Control plane listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET    /health - Health check");
    tracing::info!("  POST   /v1/requests - Submit a request");
    tracing::info!("  GET    /v1/requests/:id - Request status");
    tracing::info!("  GET    /v1/requests/:id/position - Queue position");
    tracing::info!("  DELETE /v1/requests/:id - Cancel a queued request");
    tracing::info!("  GET    /v1/queue/stats - Queue statistics");
    tracing::info!("  GET    /v1/models - Registry and residency");
    tracing::info!("  POST   /v1/models/:name/load - Load a model");
    tracing::info!("  DELETE /v1/models/:name - Unload a model");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
