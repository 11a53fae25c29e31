use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{GatewayError, Result};
use crate::geo::ranges::StaticRange;

// Used when rateLimitTime is missing or non-positive
pub const DEFAULT_WINDOW_SECS: i64 = 300;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "login-gateway")]
#[command(about = "Admission-controlled login gateway for the game server")]
pub struct Args {
    // JSON config file, created with defaults if missing
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    // SQLite database holding persisted rate limits
    #[arg(short, long, default_value = "database.db")]
    pub database: PathBuf,

    // Listen address, defaults to 0.0.0.0:<httpPort>
    #[arg(short, long)]
    pub bind: Option<String>,

    // How often the config file is checked for changes, in seconds
    #[arg(long, default_value_t = 5)]
    pub reload_interval: u64,

    // Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

// runtime configuration, mirrored 1:1 by `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    // game server address handed out to clients.
    pub ip: String,
    // game server port handed out to clients.
    pub port: u16,
    #[serde(rename = "loginurl")]
    pub login_url: String,
    // max requests per window for a client.
    pub rate_limit: u32,
    // window and cooldown length, in seconds.
    pub rate_limit_time: i64,
    // country codes allowed to reach the gateway.
    pub trusted_region: Vec<String>,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_ranges: Vec<StaticRange>,
}

fn default_http_port() -> u16 {
    443
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 17091,
            login_url: "gtbackend-login.vercel.app".to_string(),
            rate_limit: 50,
            rate_limit_time: DEFAULT_WINDOW_SECS,
            trusted_region: vec!["ID".to_string(), "SG".to_string(), "MY".to_string()],
            http_port: default_http_port(),
            static_ranges: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn window_secs(&self) -> i64 {
        if self.rate_limit_time > 0 {
            self.rate_limit_time
        } else {
            DEFAULT_WINDOW_SECS
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| GatewayError::Config {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&text)
    }

    // Reads the config, writing a default one first if the file doesn't exist
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            let config = Self::default();
            tokio::fs::write(path, serde_json::to_string_pretty(&config)?).await?;
            info!(path = %path.display(), "Created default config");
            return Ok(config);
        }
        Self::load(path).await
    }

    pub fn log_summary(&self) {
        info!(
            ip = %self.ip,
            port = self.port,
            loginurl = %self.login_url,
            rate_limit = self.rate_limit,
            rate_limit_time = self.rate_limit_time,
            trusted_region = %self.trusted_region.join(", "),
            "Config loaded"
        );
    }
}

type ReloadCallback = Box<dyn Fn(&GatewayConfig) + Send + Sync>;

// polls the config file and pushes new snapshots to the components.
// A reload that fails to read or parse is logged and ignored; the last good
// snapshot stays in effect.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    tx: watch::Sender<GatewayConfig>,
    callbacks: Vec<ReloadCallback>,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, poll_interval: Duration, initial: GatewayConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        let last_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self {
            path,
            poll_interval,
            tx,
            callbacks: Vec::new(),
            last_modified,
        }
    }

    pub fn on_reload(mut self, callback: impl Fn(&GatewayConfig) + Send + Sync + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayConfig> {
        self.tx.subscribe()
    }

    // Re-reads the file unconditionally and applies it on success
    pub async fn reload(&mut self) -> Result<()> {
        let config = GatewayConfig::load(&self.path).await?;
        if *self.tx.borrow() == config {
            debug!("Config file touched but unchanged");
            return Ok(());
        }
        for callback in &self.callbacks {
            callback(&config);
        }
        config.log_summary();
        self.tx.send_replace(config);
        Ok(())
    }

    // Reloads only if the file's mtime moved since the last poll
    pub async fn poll_once(&mut self) -> bool {
        let modified = match tokio::fs::metadata(&self.path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Cannot stat config file");
                return false;
            }
        };
        if self.last_modified == Some(modified) {
            return false;
        }
        self.last_modified = Some(modified);

        match self.reload().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Config reload failed, keeping previous config");
                false
            }
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(interval_secs = self.poll_interval.as_secs(), "Config monitor started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
        info!("Config monitor stopped");
    }
}
