//! Country-based admission: resolves a client address to a country through
//! an ordered provider chain and caches the verdict for a while.

pub mod provider;
pub mod ranges;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::metrics::{GEO_CACHE_HITS, GEO_CACHE_MISSES, GEO_CACHE_SIZE};
use provider::{GeoInfo, GeoProvider, PROVIDER_TIMEOUT};

pub const GEO_CACHE_TTL_SECS: i64 = 3600;

// cached resolution for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoCacheEntry {
    pub country_code: String,
    pub country_name: String,
    pub region: String,
    pub city: String,
    // computed against the trusted list at resolution time
    pub is_trusted: bool,
    pub cache_time: i64,
}

impl GeoCacheEntry {
    fn is_live(&self, now: i64, ttl: i64) -> bool {
        now - self.cache_time < ttl
    }
}

pub struct GeoResolver {
    providers: Vec<Arc<dyn GeoProvider>>,
    cache: DashMap<IpAddr, GeoCacheEntry>,
    trusted: RwLock<Vec<String>>,
    ttl_secs: i64,
    provider_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl GeoResolver {
    pub fn new(providers: Vec<Arc<dyn GeoProvider>>, trusted: &[String], clock: Arc<dyn Clock>) -> Self {
        Self {
            providers,
            cache: DashMap::new(),
            trusted: RwLock::new(normalize(trusted)),
            ttl_secs: GEO_CACHE_TTL_SECS,
            provider_timeout: PROVIDER_TIMEOUT,
            clock,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    // replaces the trusted set. Cached verdicts keep their value until they
    // expire.
    pub fn load_trusted_regions(&self, regions: &[String]) {
        let normalized = normalize(regions);
        debug!(regions = %normalized.join(", "), "Trusted regions updated");
        match self.trusted.write() {
            Ok(mut trusted) => *trusted = normalized,
            Err(poisoned) => *poisoned.into_inner() = normalized,
        }
    }

    pub fn trusted_regions(&self) -> Vec<String> {
        match self.trusted.read() {
            Ok(trusted) => trusted.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn is_trusted(&self, country_code: &str) -> bool {
        let code = country_code.trim().to_ascii_uppercase();
        self.trusted_regions().iter().any(|r| *r == code)
    }

    pub async fn is_allowed(&self, key: &str) -> bool {
        let addr = ranges::parse_client(key);

        // local development and LAN clients skip the lookup entirely
        if addr.as_ref().is_some_and(ranges::is_private) {
            return true;
        }

        let now = self.clock.now();
        if let Some(addr) = addr {
            if let Some(verdict) = self.cached_verdict(&addr, now) {
                GEO_CACHE_HITS.inc();
                return verdict;
            }
        }
        GEO_CACHE_MISSES.inc();

        let Some(info) = self.resolve(key, addr).await else {
            warn!(client = %key, "Every geo provider failed, denying");
            return false;
        };

        let is_trusted = self.is_trusted(&info.country_code);
        if !is_trusted {
            warn!(client = %key, country = %info.country_code, "Origin not in trusted regions");
        }

        if let Some(addr) = addr {
            self.cache.insert(
                addr,
                GeoCacheEntry {
                    country_code: info.country_code,
                    country_name: info.country_name,
                    region: info.region,
                    city: info.city,
                    is_trusted,
                    cache_time: now,
                },
            );
            let size = self.cache.len();
            GEO_CACHE_SIZE.set(size as f64);
            if size % 100 == 0 {
                debug!(size, "Geo cache size");
            }
        }

        is_trusted
    }

    fn cached_verdict(&self, addr: &IpAddr, now: i64) -> Option<bool> {
        let verdict = self
            .cache
            .get(addr)
            .map(|entry| entry.is_live(now, self.ttl_secs).then_some(entry.is_trusted));
        match verdict {
            Some(Some(trusted)) => Some(trusted),
            Some(None) => {
                self.cache.remove_if(addr, |_, e| !e.is_live(now, self.ttl_secs));
                None
            }
            None => None,
        }
    }

    async fn resolve(&self, key: &str, addr: Option<IpAddr>) -> Option<GeoInfo> {
        for provider in &self.providers {
            match tokio::time::timeout(self.provider_timeout, provider.lookup(key, addr)).await {
                Ok(Some(info)) if !info.country_code.is_empty() => return Some(info),
                Ok(_) => debug!(provider = provider.name(), client = %key, "Provider could not resolve"),
                Err(_) => debug!(provider = provider.name(), client = %key, "Provider timed out"),
            }
        }
        None
    }

    pub fn cached(&self, key: &str) -> Option<GeoCacheEntry> {
        let addr = ranges::parse_client(key)?;
        self.cache.get(&addr).map(|e| e.clone())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // drops expired cache entries, returning how many went.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.cache.len();
        self.cache.retain(|_, e| e.is_live(now, self.ttl_secs));
        let removed = before.saturating_sub(self.cache.len());
        GEO_CACHE_SIZE.set(self.cache.len() as f64);
        removed
    }
}

fn normalize(regions: &[String]) -> Vec<String> {
    regions
        .iter()
        .map(|r| r.trim().to_ascii_uppercase())
        .filter(|r| !r.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::provider::UNKNOWN_COUNTRY;
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        answer: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(answer: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeoProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn lookup(&self, _key: &str, _addr: Option<IpAddr>) -> Option<GeoInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.map(GeoInfo::from_code)
        }
    }

    struct HangingProvider;

    #[async_trait]
    impl GeoProvider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn lookup(&self, _key: &str, _addr: Option<IpAddr>) -> Option<GeoInfo> {
            std::future::pending().await
        }
    }

    fn regions(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn resolver(providers: Vec<Arc<dyn GeoProvider>>, clock: Arc<ManualClock>) -> GeoResolver {
        GeoResolver::new(providers, &regions(&["id", "SG"]), clock)
    }

    #[tokio::test]
    async fn private_addresses_skip_providers_and_cache() {
        let fake = FakeProvider::new(Some("US"));
        let geo = resolver(vec![fake.clone()], Arc::new(ManualClock::new(0)));
        for addr in ["127.0.0.1", "10.0.0.5", "192.168.1.1", "10.1.2.3"] {
            assert!(geo.is_allowed(addr).await);
        }
        assert_eq!(fake.calls(), 0);
        assert_eq!(geo.cache_len(), 0);
    }

    #[tokio::test]
    async fn cached_verdict_avoids_second_lookup() {
        let clock = Arc::new(ManualClock::new(1_000));
        let fake = FakeProvider::new(Some("ID"));
        let geo = resolver(vec![fake.clone()], clock.clone());

        assert!(geo.is_allowed("36.70.1.2").await);
        clock.advance(GEO_CACHE_TTL_SECS - 1);
        assert!(geo.is_allowed("36.70.1.2").await);
        assert_eq!(fake.calls(), 1);

        let entry = geo.cached("36.70.1.2").unwrap();
        assert_eq!(entry.country_code, "ID");
        assert!(entry.is_trusted);
        assert_eq!(entry.cache_time, 1_000);
    }

    #[tokio::test]
    async fn expired_entry_is_resolved_again() {
        let clock = Arc::new(ManualClock::new(0));
        let fake = FakeProvider::new(Some("ID"));
        let geo = resolver(vec![fake.clone()], clock.clone());

        geo.is_allowed("36.70.1.2").await;
        clock.advance(GEO_CACHE_TTL_SECS);
        geo.is_allowed("36.70.1.2").await;
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn chain_falls_through_to_first_answer() {
        let first = FakeProvider::new(None);
        let second = FakeProvider::new(Some("MY"));
        let third = FakeProvider::new(Some("ID"));
        let geo = resolver(vec![first.clone(), second.clone(), third.clone()], Arc::new(ManualClock::new(0)));

        assert!(!geo.is_allowed("175.140.0.1").await);
        assert_eq!((first.calls(), second.calls(), third.calls()), (1, 1, 0));
        assert_eq!(geo.cached("175.140.0.1").unwrap().country_code, "MY");
    }

    #[tokio::test]
    async fn total_failure_denies_without_caching() {
        let fake = FakeProvider::new(None);
        let geo = resolver(vec![fake.clone()], Arc::new(ManualClock::new(0)));

        assert!(!geo.is_allowed("45.1.2.3").await);
        assert_eq!(geo.cache_len(), 0);
        assert!(!geo.is_allowed("45.1.2.3").await);
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_country_is_cached_and_untrusted() {
        let fake = FakeProvider::new(Some(UNKNOWN_COUNTRY));
        let geo = resolver(vec![fake.clone()], Arc::new(ManualClock::new(0)));

        assert!(!geo.is_allowed("100.64.0.9").await);
        assert!(!geo.is_allowed("100.64.0.9").await);
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_key_is_resolved_but_not_cached() {
        let fake = FakeProvider::new(Some("ID"));
        let geo = resolver(vec![fake.clone()], Arc::new(ManualClock::new(0)));

        assert!(geo.is_allowed("not-an-address").await);
        assert!(geo.is_allowed("not-an-address").await);
        assert_eq!(fake.calls(), 2);
        assert_eq!(geo.cache_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_is_cut_off() {
        let fallback = FakeProvider::new(Some("SG"));
        let geo = resolver(vec![Arc::new(HangingProvider), fallback.clone()], Arc::new(ManualClock::new(0)))
            .with_provider_timeout(Duration::from_secs(5));

        assert!(geo.is_allowed("165.21.3.4").await);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn trusted_reload_does_not_touch_cached_verdicts() {
        let clock = Arc::new(ManualClock::new(0));
        let fake = FakeProvider::new(Some("ID"));
        let geo = resolver(vec![fake.clone()], clock);

        assert!(geo.is_allowed("36.70.1.2").await);
        geo.load_trusted_regions(&regions(&[" my "]));
        assert_eq!(geo.trusted_regions(), vec!["MY".to_string()]);
        // still cached as trusted
        assert!(geo.is_allowed("36.70.1.2").await);
        // fresh resolution uses the new list
        assert!(!geo.is_allowed("36.70.1.3").await);
    }

    #[tokio::test]
    async fn evict_expired_bounds_the_cache() {
        let clock = Arc::new(ManualClock::new(0));
        let geo = resolver(vec![FakeProvider::new(Some("ID"))], clock.clone());

        geo.is_allowed("36.70.1.2").await;
        clock.advance(10);
        geo.is_allowed("36.70.1.3").await;
        clock.advance(GEO_CACHE_TTL_SECS - 5);

        assert_eq!(geo.evict_expired(), 1);
        assert_eq!(geo.cache_len(), 1);
        assert!(geo.cached("36.70.1.3").is_some());
    }
}
