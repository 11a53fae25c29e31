use std::sync::Arc;

use tokio::sync::watch;

use crate::config::GatewayConfig;
use crate::geo::GeoResolver;
use crate::pipeline::AdmissionPipeline;
use crate::rate_limit::RateLimiter;

// app's shared state, built once at startup and handed to the router
pub struct AppState {
    pub pipeline: Arc<AdmissionPipeline>,
    pub limiter: Arc<RateLimiter>,
    pub geo: Arc<GeoResolver>,
    pub config: watch::Receiver<GatewayConfig>, // latest good config snapshot
}
