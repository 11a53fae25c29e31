use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::Clock;
use crate::error::Result;
use crate::geo::GeoResolver;
use crate::rate_limit::RateLimiter;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
// every 5th cleanup, ~2.5 minutes
pub const SAVE_EVERY: u32 = 5;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub expired: usize,
    pub inactive: usize,
    pub geo_evicted: usize,
    pub saved: Option<usize>,
}

// background upkeep for the limiter and the geo cache. `run_cycle` does a
// single pass so tests can drive it without waiting on the timer.
pub struct MaintenanceScheduler {
    limiter: Arc<RateLimiter>,
    geo: Arc<GeoResolver>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    save_every: u32,
    cycles: u32,
    save_pending: bool,
}

impl MaintenanceScheduler {
    pub fn new(limiter: Arc<RateLimiter>, geo: Arc<GeoResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter,
            geo,
            clock,
            interval: CLEANUP_INTERVAL,
            save_every: SAVE_EVERY,
            cycles: 0,
            save_pending: false,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_save_every(mut self, save_every: u32) -> Self {
        self.save_every = save_every.max(1);
        self
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let now = self.clock.now();
        let (expired, inactive) = self.limiter.cleanup(now).await;
        let geo_evicted = self.geo.evict_expired();

        self.cycles += 1;
        let mut saved = None;
        // a failed save is retried on the following cycle instead of waiting a full round
        if self.save_pending || self.cycles % self.save_every == 0 {
            match self.limiter.save_state(now).await {
                Ok(count) => {
                    self.save_pending = false;
                    saved = Some(count);
                }
                Err(e) => {
                    self.save_pending = true;
                    error!(error = %e, "Periodic rate limit save failed");
                }
            }
            self.limiter.log_stats();
        }

        CycleReport {
            expired,
            inactive,
            geo_evicted,
            saved,
        }
    }

    // loops until `shutdown` fires, then does one last synchronous save.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<usize> {
        info!(interval_secs = self.interval.as_secs(), "Maintenance task started");

        // first pass one interval after startup, not immediately
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        let saved = self.limiter.save_state(self.clock.now()).await;
        let stats = self.limiter.stats();
        info!(
            allowed = stats.allowed_requests,
            blocked = stats.blocked_requests,
            "Maintenance task stopped"
        );
        saved
    }
}
