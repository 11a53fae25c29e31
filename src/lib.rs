pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod maintenance;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod state;

pub use error::{GatewayError, Result};
