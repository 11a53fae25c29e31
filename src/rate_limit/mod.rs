//! Per-client sliding window limiter with a cooldown once the limit is
//! exceeded. Clients under cooldown are persisted so they stay limited
//! across restarts.

pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::metrics::{LIMITED_CLIENTS, REQUESTS_ALLOWED, REQUESTS_BLOCKED};
use store::{LimitRow, RateLimitStore};

// Rate limit record - tracks requests per client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub request_count: u32,
    // 0 until first evaluated against the config
    pub max_requests: u32,
    pub window_start_time: i64,
    // fixed when the window opens, reloads only apply to the next one
    pub window_secs: i64,
    pub last_request_time: i64,
    pub cooldown_end_time: i64,
    pub is_limited: bool,
}

impl RateLimitRecord {
    fn new(now: i64, window_secs: i64) -> Self {
        Self {
            request_count: 0,
            max_requests: 0,
            window_start_time: now,
            window_secs,
            last_request_time: now,
            cooldown_end_time: 0,
            is_limited: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { retry_after: i64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_requests: u32,
    pub window_secs: i64,
    pub cooldown_secs: i64,
}

impl Limits {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_requests: config.rate_limit,
            window_secs: config.window_secs(),
            cooldown_secs: config.window_secs(),
        }
    }
}

// process-lifetime counters. Only `currently_limited` ever goes down.
#[derive(Debug, Default)]
pub struct Statistics {
    pub total_requests: AtomicU64,
    pub allowed_requests: AtomicU64,
    pub blocked_requests: AtomicU64,
    pub currently_limited: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub currently_limited: i64,
}

impl Statistics {
    fn allowed(&self) {
        self.allowed_requests.fetch_add(1, Ordering::Relaxed);
        REQUESTS_ALLOWED.inc();
    }

    fn blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        REQUESTS_BLOCKED.inc();
    }

    fn set_limited(&self, count: i64) {
        self.currently_limited.store(count, Ordering::Relaxed);
        LIMITED_CLIENTS.set(count as f64);
    }

    fn add_limited(&self, delta: i64) {
        let now = self.currently_limited.fetch_add(delta, Ordering::Relaxed) + delta;
        LIMITED_CLIENTS.set(now as f64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            currently_limited: self.currently_limited.load(Ordering::Relaxed),
        }
    }
}

pub struct RateLimiter {
    records: Mutex<HashMap<String, RateLimitRecord>>,
    limits: RwLock<Limits>,
    store: Arc<dyn RateLimitStore>,
    stats: Statistics,
}

impl RateLimiter {
    pub fn new(limits: Limits, store: Arc<dyn RateLimitStore>) -> Self {
        info!(
            max_requests = limits.max_requests,
            window_secs = limits.window_secs,
            "Rate limiter initialized"
        );
        Self {
            records: Mutex::new(HashMap::new()),
            limits: RwLock::new(limits),
            store,
            stats: Statistics::default(),
        }
    }

    pub fn limits(&self) -> Limits {
        match self.limits.read() {
            Ok(limits) => *limits,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    // hot-reload hook: open windows keep their length and max_requests,
    // the new values apply from the next window a client opens
    pub fn apply_config(&self, config: &GatewayConfig) {
        let limits = Limits::from_config(config);
        match self.limits.write() {
            Ok(mut current) => *current = limits,
            Err(poisoned) => *poisoned.into_inner() = limits,
        }
        debug!(max_requests = limits.max_requests, window_secs = limits.window_secs, "Rate limits updated");
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn check(&self, key: &str, now: i64) -> Decision {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let limits = self.limits();

        let mut records = self.records.lock().await;
        let data = records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::new(now, limits.window_secs));

        if data.is_limited {
            if now >= data.cooldown_end_time {
                data.is_limited = false;
                data.request_count = 1;
                data.window_start_time = now;
                data.window_secs = limits.window_secs;
                data.last_request_time = now;
                data.max_requests = limits.max_requests;

                self.stats.add_limited(-1);
                self.stats.allowed();
                if let Err(e) = self.store.remove(key).await {
                    warn!(client = %key, error = %e, "Failed to remove persisted rate limit");
                }

                debug!(client = %key, "Rate limit expired, allowing request");
                return Decision::Allow;
            }

            self.stats.blocked();
            let retry_after = data.cooldown_end_time - now;
            debug!(client = %key, retry_after, "Client is still rate limited");
            return Decision::Deny { retry_after };
        }

        // the window restarts at the first request after it lapsed
        if now - data.window_start_time >= data.window_secs {
            data.request_count = 1;
            data.window_start_time = now;
            data.window_secs = limits.window_secs;
        } else {
            data.request_count += 1;
        }
        data.last_request_time = now;

        if data.max_requests == 0 {
            data.max_requests = limits.max_requests;
        }

        if data.request_count > data.max_requests {
            data.is_limited = true;
            data.cooldown_end_time = now + limits.cooldown_secs;

            self.stats.add_limited(1);
            self.stats.blocked();

            let row = LimitRow {
                client_key: key.to_string(),
                time_added: now,
                cooldown_end: data.cooldown_end_time,
            };
            if let Err(e) = self.store.upsert(&row).await {
                warn!(client = %key, error = %e, "Failed to persist rate limit");
            }

            warn!(
                client = %key,
                requests = data.request_count,
                elapsed = now - data.window_start_time,
                cooldown = limits.cooldown_secs,
                "Rate limit applied"
            );
            return Decision::Deny {
                retry_after: limits.cooldown_secs,
            };
        }

        self.stats.allowed();

        // only worth a line once a client is past 70% of its budget
        if u64::from(data.request_count) * 10 > u64::from(data.max_requests) * 7 {
            debug!(
                client = %key,
                requests = data.request_count,
                max = data.max_requests,
                "Client nearing rate limit"
            );
        }
        Decision::Allow
    }

    // restores persisted cooldowns that haven't run out yet. Expired rows
    // are skipped. Store errors are returned so startup can abort.
    pub async fn load_state(&self, now: i64) -> Result<usize> {
        let rows = self.store.load_all().await?;
        let limits = self.limits();
        let max_requests = limits.max_requests;

        let mut records = self.records.lock().await;
        let mut loaded = 0;
        for row in rows {
            if row.cooldown_end <= now {
                continue;
            }
            records.insert(
                row.client_key,
                RateLimitRecord {
                    request_count: max_requests,
                    max_requests,
                    window_start_time: row.time_added,
                    window_secs: limits.window_secs,
                    last_request_time: row.time_added,
                    cooldown_end_time: row.cooldown_end,
                    is_limited: true,
                },
            );
            loaded += 1;
        }
        let limited = records.values().filter(|r| r.is_limited).count();
        self.stats.set_limited(limited as i64);

        info!(count = loaded, "Loaded active rate limits from database");
        Ok(loaded)
    }

    // replaces the persisted set with every client still under cooldown.
    pub async fn save_state(&self, now: i64) -> Result<usize> {
        let records = self.records.lock().await;
        let mut rows: Vec<LimitRow> = records
            .iter()
            .filter(|(_, r)| r.is_limited && r.cooldown_end_time > now)
            .map(|(key, r)| LimitRow {
                client_key: key.clone(),
                time_added: r.last_request_time,
                cooldown_end: r.cooldown_end_time,
            })
            .collect();
        rows.sort_by(|a, b| a.client_key.cmp(&b.client_key));

        self.store.replace_all(&rows).await?;
        info!(count = rows.len(), "Saved active rate limits to database");
        Ok(rows.len())
    }

    // drops cooldowns that ran out and clients idle for two windows.
    // Returns (expired, inactive).
    pub async fn cleanup(&self, now: i64) -> (usize, usize) {
        let mut removed = 0;
        let mut inactive = 0;

        let mut records = self.records.lock().await;
        records.retain(|_, data| {
            if data.is_limited && data.cooldown_end_time <= now {
                removed += 1;
                false
            } else if !data.is_limited && now - data.last_request_time > data.window_secs * 2 {
                inactive += 1;
                false
            } else {
                true
            }
        });
        drop(records);

        if removed > 0 {
            self.stats.add_limited(-(removed as i64));
        }
        if removed > 0 || inactive > 0 {
            debug!(removed, inactive, "Rate limit cleanup");
        }
        (removed, inactive)
    }

    // forgets every client, in memory and in the store.
    pub async fn clear_all(&self) -> Result<()> {
        let mut records = self.records.lock().await;
        records.clear();
        self.stats.set_limited(0);
        self.store.clear().await?;
        info!("All rate limits cleared");
        Ok(())
    }

    pub async fn record(&self, key: &str) -> Option<RateLimitRecord> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            total = s.total_requests,
            allowed = s.allowed_requests,
            blocked = s.blocked_requests,
            limited = s.currently_limited,
            "Rate limiter stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::store::SqliteRateLimitStore;
    use super::*;
    use crate::error::GatewayError;
    use async_trait::async_trait;

    // every call fails the way a closed pool does
    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn load_all(&self) -> Result<Vec<LimitRow>> {
            Err(GatewayError::Store(sqlx::Error::PoolClosed))
        }

        async fn upsert(&self, _row: &LimitRow) -> Result<()> {
            Err(GatewayError::Store(sqlx::Error::PoolClosed))
        }

        async fn remove(&self, _client_key: &str) -> Result<()> {
            Err(GatewayError::Store(sqlx::Error::PoolClosed))
        }

        async fn replace_all(&self, _rows: &[LimitRow]) -> Result<()> {
            Err(GatewayError::Store(sqlx::Error::PoolClosed))
        }

        async fn clear(&self) -> Result<()> {
            Err(GatewayError::Store(sqlx::Error::PoolClosed))
        }
    }

    fn limits(max_requests: u32, window_secs: i64) -> Limits {
        Limits {
            max_requests,
            window_secs,
            cooldown_secs: window_secs,
        }
    }

    async fn limiter(max_requests: u32, window_secs: i64) -> (RateLimiter, Arc<SqliteRateLimitStore>) {
        let store = Arc::new(SqliteRateLimitStore::in_memory().await.unwrap());
        (RateLimiter::new(limits(max_requests, window_secs), store.clone()), store)
    }

    #[tokio::test]
    async fn fourth_request_in_window_is_denied_then_resets() {
        let (limiter, store) = limiter(3, 60).await;
        for t in 0..3 {
            assert_eq!(limiter.check("A", t).await, Decision::Allow);
        }
        assert_eq!(limiter.check("A", 3).await, Decision::Deny { retry_after: 60 });

        let record = limiter.record("A").await.unwrap();
        assert!(record.is_limited);
        assert_eq!(record.cooldown_end_time, 63);
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        assert_eq!(limiter.check("A", 61).await, Decision::Deny { retry_after: 2 });
        assert_eq!(limiter.check("A", 62).await, Decision::Deny { retry_after: 1 });
        assert_eq!(limiter.check("A", 63).await, Decision::Allow);

        let record = limiter.record("A").await.unwrap();
        assert!(!record.is_limited);
        assert_eq!(record.request_count, 1);
        assert_eq!(record.window_start_time, 63);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn window_lapse_resets_the_count() {
        let (limiter, _) = limiter(3, 60).await;
        for t in [0, 1, 2] {
            assert!(limiter.check("A", t).await.is_allowed());
        }
        // 61 - 0 >= 60, fresh window
        assert!(limiter.check("A", 61).await.is_allowed());
        assert_eq!(limiter.record("A").await.unwrap().request_count, 1);
        assert_eq!(limiter.record("A").await.unwrap().window_start_time, 61);
    }

    #[tokio::test]
    async fn clients_are_counted_separately() {
        let (limiter, _) = limiter(1, 60).await;
        assert!(limiter.check("A", 0).await.is_allowed());
        assert!(limiter.check("B", 0).await.is_allowed());
        assert!(!limiter.check("A", 1).await.is_allowed());
        assert!(limiter.check("C", 1).await.is_allowed());
    }

    #[tokio::test]
    async fn statistics_track_decisions() {
        let (limiter, _) = limiter(2, 60).await;
        for t in 0..5 {
            limiter.check("A", t).await;
        }
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.allowed_requests, 2);
        assert_eq!(stats.blocked_requests, 3);
        assert_eq!(stats.currently_limited, 1);

        limiter.check("A", 100).await;
        assert_eq!(limiter.stats().currently_limited, 0);
    }

    #[tokio::test]
    async fn config_change_only_affects_new_records() {
        let (limiter, _) = limiter(2, 60).await;
        limiter.check("old", 0).await;

        let config = GatewayConfig {
            rate_limit: 5,
            rate_limit_time: 60,
            ..GatewayConfig::default()
        };
        limiter.apply_config(&config);

        limiter.check("new", 0).await;
        assert_eq!(limiter.record("old").await.unwrap().max_requests, 2);
        assert_eq!(limiter.record("new").await.unwrap().max_requests, 5);

        // old record still limited at its own max
        limiter.check("old", 1).await;
        assert!(!limiter.check("old", 2).await.is_allowed());
    }

    #[tokio::test]
    async fn save_is_idempotent_and_skips_expired() {
        let (limiter, store) = limiter(1, 60).await;
        limiter.check("A", 0).await;
        limiter.check("A", 1).await; // limited until 61
        limiter.check("B", 30).await;
        limiter.check("B", 31).await; // limited until 91
        limiter.check("C", 31).await; // not limited

        assert_eq!(limiter.save_state(40).await.unwrap(), 2);
        let first = store.load_all().await.unwrap();
        assert_eq!(limiter.save_state(40).await.unwrap(), 2);
        assert_eq!(store.load_all().await.unwrap(), first);

        assert_eq!(limiter.save_state(70).await.unwrap(), 1);
        let rows = store.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_key, "B");
    }

    #[tokio::test]
    async fn load_state_restores_only_unexpired_cooldowns() {
        let store = Arc::new(SqliteRateLimitStore::in_memory().await.unwrap());
        store
            .replace_all(&[
                LimitRow { client_key: "live".into(), time_added: 0, cooldown_end: 200 },
                LimitRow { client_key: "dead".into(), time_added: 0, cooldown_end: 100 },
            ])
            .await
            .unwrap();

        let limiter = RateLimiter::new(limits(3, 60), store);
        assert_eq!(limiter.load_state(100).await.unwrap(), 1);
        assert_eq!(limiter.stats().currently_limited, 1);
        assert!(limiter.record("dead").await.is_none());
        assert_eq!(limiter.check("live", 150).await, Decision::Deny { retry_after: 50 });
        assert!(limiter.check("live", 200).await.is_allowed());
    }

    #[tokio::test]
    async fn cleanup_drops_expired_and_idle_clients() {
        let (limiter, _) = limiter(1, 60).await;
        limiter.check("limited", 0).await;
        limiter.check("limited", 1).await; // cooldown until 61
        limiter.check("idle", 0).await;
        limiter.check("active", 100).await;

        assert_eq!(limiter.cleanup(50).await, (0, 0));
        assert_eq!(limiter.cleanup(121).await, (1, 1));
        assert_eq!(limiter.len().await, 1);
        assert!(limiter.record("active").await.is_some());
        assert_eq!(limiter.stats().currently_limited, 0);
    }

    #[tokio::test]
    async fn clear_all_empties_memory_and_store() {
        let (limiter, store) = limiter(1, 60).await;
        limiter.check("A", 0).await;
        limiter.check("A", 1).await;
        limiter.clear_all().await.unwrap();
        assert_eq!(limiter.len().await, 0);
        assert_eq!(limiter.stats().currently_limited, 0);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_checks_never_overshoot() {
        let (limiter, _) = limiter(10, 60).await;
        let limiter = Arc::new(limiter);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.check("A", 5).await }));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn reload_does_not_resize_an_open_window() {
        let (limiter, _) = limiter(3, 300).await;
        for t in 0..3 {
            assert!(limiter.check("A", t).await.is_allowed());
        }

        limiter.apply_config(&GatewayConfig {
            rate_limit: 3,
            rate_limit_time: 60,
            ..GatewayConfig::default()
        });

        // still inside the 300s window opened at t=0, the new 60s cooldown applies
        assert_eq!(limiter.check("A", 100).await, Decision::Deny { retry_after: 60 });
        assert_eq!(limiter.record("A").await.unwrap().window_secs, 300);

        // a window opened after the reload gets the new length
        assert!(limiter.check("B", 100).await.is_allowed());
        assert_eq!(limiter.record("B").await.unwrap().window_secs, 60);
        assert!(limiter.check("B", 160).await.is_allowed());
        assert_eq!(limiter.record("B").await.unwrap().request_count, 1);

        // leaving cooldown opens a fresh window at the new length
        assert!(limiter.check("A", 160).await.is_allowed());
        assert_eq!(limiter.record("A").await.unwrap().window_secs, 60);
    }

    #[tokio::test]
    async fn load_failure_is_reported_and_loads_nothing() {
        let limiter = RateLimiter::new(limits(3, 60), Arc::new(BrokenStore));
        assert!(matches!(limiter.load_state(0).await, Err(GatewayError::Store(_))));
        assert_eq!(limiter.len().await, 0);
        assert_eq!(limiter.stats().currently_limited, 0);
    }

    #[tokio::test]
    async fn store_write_failures_do_not_change_decisions() {
        let limiter = RateLimiter::new(limits(1, 60), Arc::new(BrokenStore));
        assert!(limiter.check("A", 0).await.is_allowed());
        assert_eq!(limiter.check("A", 1).await, Decision::Deny { retry_after: 60 });
        assert!(limiter.record("A").await.unwrap().is_limited);
        assert_eq!(limiter.stats().currently_limited, 1);

        assert_eq!(limiter.check("A", 30).await, Decision::Deny { retry_after: 31 });
        assert!(limiter.check("A", 61).await.is_allowed());
        assert_eq!(limiter.stats().currently_limited, 0);
        assert!(limiter.save_state(61).await.is_err());
    }
}
