use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser; // for cli
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use login_gateway::clock::{Clock, SystemClock};
use login_gateway::config::{Args, ConfigWatcher, GatewayConfig};
use login_gateway::geo::{GeoResolver, provider};
use login_gateway::handlers;
use login_gateway::maintenance::MaintenanceScheduler;
use login_gateway::pipeline::AdmissionPipeline;
use login_gateway::rate_limit::store::SqliteRateLimitStore;
use login_gateway::rate_limit::{Limits, RateLimiter};
use login_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // parse cli arguments
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    info!("Initializing gateway...");

    let config = GatewayConfig::load_or_create(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    config.log_summary();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let geo = Arc::new(GeoResolver::new(
        provider::default_chain(reqwest::Client::new(), &config.static_ranges),
        &config.trusted_region,
        clock.clone(),
    ));
    info!("Geolocation service initialized");

    let store = Arc::new(
        SqliteRateLimitStore::open(&args.database)
            .await
            .with_context(|| format!("Failed to open database {}", args.database.display()))?,
    );
    let limiter = Arc::new(RateLimiter::new(Limits::from_config(&config), store.clone()));
    // a store read failure here is fatal
    limiter
        .load_state(clock.now())
        .await
        .context("Failed to load rate limiter data")?;

    let shutdown = CancellationToken::new();

    let watcher = ConfigWatcher::new(
        args.config.clone(),
        Duration::from_secs(args.reload_interval.max(1)),
        config.clone(),
    )
    .on_reload({
        let limiter = limiter.clone();
        move |cfg| limiter.apply_config(cfg)
    })
    .on_reload({
        let geo = geo.clone();
        move |cfg| geo.load_trusted_regions(&cfg.trusted_region)
    });
    let config_rx = watcher.subscribe();
    let watcher_task = tokio::spawn(watcher.run(shutdown.clone()));

    let maintenance = tokio::spawn(
        MaintenanceScheduler::new(limiter.clone(), geo.clone(), clock.clone()).run(shutdown.clone()),
    );

    let state = Arc::new(AppState {
        pipeline: Arc::new(AdmissionPipeline::new(geo.clone(), limiter.clone(), clock)),
        limiter,
        geo,
        config: config_rx,
    });
    let app = handlers::router(state);

    let addr = args
        .bind
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.http_port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(%addr, "Gateway listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    match maintenance.await {
        Ok(Ok(count)) => info!(count, "Final rate limit save complete"),
        Ok(Err(e)) => error!(error = %e, "Final rate limit save failed"),
        Err(e) => error!(error = %e, "Maintenance task panicked"),
    }
    if let Err(e) = watcher_task.await {
        error!(error = %e, "Config monitor panicked");
    }
    store.close().await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for shutdown signal");
                    shutdown.cancelled().await;
                }
            }
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
