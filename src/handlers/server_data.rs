use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::state::AppState;

const CLIENT_AGENT: &str = "UbiServices_SDK";

// Login handshake: tells the game client where the game server lives
pub async fn server_data_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let has_params = query.is_some_and(|q| !q.is_empty()) || !body.is_empty();
    let from_client = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ua| ua.contains(CLIENT_AGENT));
    if !has_params || !from_client {
        return StatusCode::FORBIDDEN.into_response();
    }

    let config = state.config.borrow().clone();
    let meta = format!("Gateway_{}", 1000 + chrono::Utc::now().timestamp_subsec_micros() % 9000);
    let content = format!(
        "server|{}\nport|{}\ntype|1\n# maint|Server is currently down for maintenance. We will be back soon!\nloginurl|{}\nmeta|{}\nRTENDMARKERBS1001\n",
        config.ip, config.port, config.login_url, meta
    );
    ([(header::CONTENT_TYPE, "text/html")], content).into_response()
}
