//! Request-time admission: origin first, then rate. A request denied by
//! origin never touches the rate limiter, so probing from a blocked region
//! can't earn a persisted cooldown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use crate::clock::Clock;
use crate::geo::GeoResolver;
use crate::metrics::{ADMISSION_LATENCY, GEO_DENIED, REQUEST_TOTAL};
use crate::rate_limit::{Decision, RateLimiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    DenyGeo,
    DenyRate { retry_after: i64 },
}

impl Admission {
    /// `None` for `Allow`, the fixed 403/429 response otherwise.
    pub fn denial(self) -> Option<Response> {
        match self {
            Admission::Allow => None,
            Admission::DenyGeo => Some(
                (StatusCode::FORBIDDEN, Json(json!({ "error": "Access denied" }))).into_response(),
            ),
            Admission::DenyRate { retry_after } => Some(
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after.to_string())],
                    Json(json!({
                        "error": "Rate limited",
                        "retry_after": retry_after,
                        "time_left": time_left(retry_after),
                    })),
                )
                    .into_response(),
            ),
        }
    }
}

// "4m 10s"
pub fn time_left(secs: i64) -> String {
    format!("{}m {}s", secs / 60, secs % 60)
}

pub struct AdmissionPipeline {
    geo: Arc<GeoResolver>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl AdmissionPipeline {
    pub fn new(geo: Arc<GeoResolver>, limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> Self {
        Self { geo, limiter, clock }
    }

    pub async fn evaluate(&self, client_key: &str) -> Admission {
        REQUEST_TOTAL.inc();
        let start = Instant::now();

        let admission = if !self.geo.is_allowed(client_key).await {
            GEO_DENIED.inc();
            Admission::DenyGeo
        } else {
            match self.limiter.check(client_key, self.clock.now()).await {
                Decision::Allow => Admission::Allow,
                Decision::Deny { retry_after } => Admission::DenyRate { retry_after },
            }
        };

        ADMISSION_LATENCY.observe(start.elapsed().as_secs_f64());
        admission
    }
}

// Runs in front of every route; denied requests never reach the handlers
pub async fn admission_middleware(
    State(pipeline): State<Arc<AdmissionPipeline>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client_key = addr.ip().to_string();
    let admission = pipeline.evaluate(&client_key).await;
    match admission.denial() {
        Some(response) => {
            debug!(client = %client_key, path = %request.uri().path(), ?admission, "Request denied");
            response
        }
        None => next.run(request).await,
    }
}
