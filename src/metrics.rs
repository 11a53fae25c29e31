use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gateway_requests_total", "Total number of requests").unwrap();
    pub static ref REQUESTS_ALLOWED: Counter =
        register_counter!("gateway_requests_allowed_total", "Requests admitted by the rate limiter").unwrap();
    pub static ref REQUESTS_BLOCKED: Counter =
        register_counter!("gateway_requests_blocked_total", "Requests denied by the rate limiter").unwrap();
    pub static ref GEO_DENIED: Counter =
        register_counter!("gateway_geo_denied_total", "Requests denied by origin").unwrap();
    pub static ref LIMITED_CLIENTS: Gauge =
        register_gauge!("gateway_limited_clients", "Clients currently in cooldown").unwrap();
    pub static ref GEO_CACHE_HITS: Counter =
        register_counter!("gateway_geo_cache_hits_total", "Geo cache hits").unwrap();
    pub static ref GEO_CACHE_MISSES: Counter =
        register_counter!("gateway_geo_cache_misses_total", "Geo cache misses").unwrap();
    pub static ref GEO_CACHE_SIZE: Gauge =
        register_gauge!("gateway_geo_cache_size", "Current number of cached geo resolutions").unwrap();
    pub static ref ADMISSION_LATENCY: Histogram = register_histogram!(
        "gateway_admission_latency_seconds",
        "Time spent deciding whether to admit a request"
    )
    .unwrap();
}

// Prometheus text exposition of everything registered above
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
