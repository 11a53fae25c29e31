use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::ranges::{self, RangeTable, StaticRange};

pub const UNKNOWN: &str = "Unknown";
// Country code for addresses that resolve to no country at all
pub const UNKNOWN_COUNTRY: &str = "XX";

pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// What a provider learned about an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoInfo {
    pub country_code: String,
    pub country_name: String,
    pub region: String,
    pub city: String,
}

impl GeoInfo {
    pub fn from_code(code: &str) -> Self {
        Self {
            country_code: code.to_string(),
            country_name: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
        }
    }
}

/// One link of the resolution chain. `None` means "failed, try the next one".
#[async_trait]
pub trait GeoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `addr` is `None` when the client key didn't parse as an address.
    async fn lookup(&self, key: &str, addr: Option<IpAddr>) -> Option<GeoInfo>;
}

/// JSON field names a remote provider uses.
#[derive(Debug, Clone)]
pub struct FieldKeys {
    pub country_code: &'static str,
    pub country_name: Option<&'static str>,
    pub region: Option<&'static str>,
    pub city: Option<&'static str>,
}

/// Remote lookup service: GET against a URL template with `{ip}` in it.
pub struct HttpGeoProvider {
    name: String,
    url_template: String,
    keys: FieldKeys,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpGeoProvider {
    pub fn new(name: &str, url_template: &str, keys: FieldKeys, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            keys,
            client,
            timeout: PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ip_api(client: reqwest::Client) -> Self {
        Self::new(
            "ip-api.com",
            "http://ip-api.com/json/{ip}?fields=status,countryCode,country,regionName,city",
            FieldKeys {
                country_code: "countryCode",
                country_name: Some("country"),
                region: Some("regionName"),
                city: Some("city"),
            },
            client,
        )
    }

    pub fn ipinfo(client: reqwest::Client) -> Self {
        Self::new(
            "ipinfo.io",
            "https://ipinfo.io/{ip}/json",
            FieldKeys {
                country_code: "country",
                country_name: None,
                region: Some("region"),
                city: Some("city"),
            },
            client,
        )
    }

    fn parse(&self, body: &Value) -> Option<GeoInfo> {
        let field = |key: Option<&str>| {
            key.and_then(|k| body.get(k))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(UNKNOWN)
                .to_string()
        };
        let code = body
            .get(self.keys.country_code)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        Some(GeoInfo {
            country_code: code.to_string(),
            country_name: field(self.keys.country_name),
            region: field(self.keys.region),
            city: field(self.keys.city),
        })
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, key: &str, addr: Option<IpAddr>) -> Option<GeoInfo> {
        // never put unparsed client input into a URL
        let Some(addr) = addr else {
            debug!(provider = %self.name, client = %key, "Skipping remote lookup for malformed address");
            return None;
        };
        let url = self.url_template.replace("{ip}", &addr.to_string());

        let res = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(res) => res,
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Geo request failed");
                return None;
            }
        };
        if !res.status().is_success() {
            debug!(provider = %self.name, status = %res.status(), "Geo provider returned error status");
            return None;
        }
        match res.json::<Value>().await {
            Ok(body) => {
                let info = self.parse(&body);
                if let Some(info) = &info {
                    debug!(provider = %self.name, client = %addr, country = %info.country_code, "Resolved country");
                }
                info
            }
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Malformed geo response");
                None
            }
        }
    }
}

/// Offline fallback backed by the range table.
pub struct StaticRangeProvider {
    table: RangeTable,
}

impl StaticRangeProvider {
    pub fn new(table: RangeTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl GeoProvider for StaticRangeProvider {
    fn name(&self) -> &str {
        "static-ranges"
    }

    async fn lookup(&self, _key: &str, addr: Option<IpAddr>) -> Option<GeoInfo> {
        let addr = addr?;
        self.table.lookup(&addr).map(GeoInfo::from_code)
    }
}

/// Last resort. Only answers for non-routable space, and always with the
/// unknown country, so it can never make an address trusted.
pub struct HeuristicProvider;

#[async_trait]
impl GeoProvider for HeuristicProvider {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn lookup(&self, _key: &str, addr: Option<IpAddr>) -> Option<GeoInfo> {
        let addr = addr?;
        ranges::is_reserved(&addr).then(|| GeoInfo::from_code(UNKNOWN_COUNTRY))
    }
}

// ip-api -> ipinfo -> static table -> heuristic
pub fn default_chain(client: reqwest::Client, static_ranges: &[StaticRange]) -> Vec<Arc<dyn GeoProvider>> {
    vec![
        Arc::new(HttpGeoProvider::ip_api(client.clone())),
        Arc::new(HttpGeoProvider::ipinfo(client)),
        Arc::new(StaticRangeProvider::new(RangeTable::with_overrides(static_ranges))),
        Arc::new(HeuristicProvider),
    ]
}
