use std::sync::Arc;

use axum::{Json, extract::State};

use crate::config::GatewayConfig;
use crate::state::AppState;

pub async fn config_handler(State(state): State<Arc<AppState>>) -> Json<GatewayConfig> {
    Json(state.config.borrow().clone())
}
