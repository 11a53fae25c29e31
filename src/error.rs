use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the gateway's components.
///
/// Geo provider failures never show up here: they are absorbed by the
/// provider chain and turned into deny decisions.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("failed to read config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
