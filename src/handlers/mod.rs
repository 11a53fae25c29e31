mod config;
mod health;
mod metrics;
mod server_data;

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::pipeline::admission_middleware;
use crate::state::AppState;

pub use config::config_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use server_data::server_data_handler;

async fn index_handler() -> &'static str {
    "Hello World!"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

// Every route, the fallback included, sits behind the admission check.
// Serve with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/config", get(config_handler))
        .route("/growtopia/server_data.php", post(server_data_handler))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.pipeline),
            admission_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
