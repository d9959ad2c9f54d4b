use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep_until, timeout, Instant};

use crate::config::HarvestConfig;
use crate::utils;

const COUNTRY: &str = "Belarus";

pub type Coordinates = (f64, f64);

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Resolves an address/city pair to coordinates. Never fails: anything that
/// goes wrong degrades to `None`.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: Option<&str>, city: Option<&str>) -> Option<Coordinates>;
}

/// Used when geocoding is switched off.
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    async fn geocode(&self, _address: Option<&str>, _city: Option<&str>) -> Option<Coordinates> {
        None
    }
}

/// The external search behind the cache. `Ok(None)` means "no match".
#[async_trait]
pub trait GeocodeLookup: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

pub struct NominatimLookup {
    client: Client,
    endpoint: String,
}

impl NominatimLookup {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl GeocodeLookup for NominatimLookup {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(|err| GeocodeError::Http(err.to_string()))?
            .error_for_status()
            .map_err(|err| GeocodeError::Http(err.to_string()))?;

        let places: Vec<NominatimPlace> = response
            .json()
            .await
            .map_err(|err| GeocodeError::Parse(err.to_string()))?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let lat = place.lat.parse::<f64>().map_err(|err| GeocodeError::Parse(err.to_string()))?;
        let lon = place.lon.parse::<f64>().map_err(|err| GeocodeError::Parse(err.to_string()))?;
        Ok(Some((lat, lon)))
    }
}

/// Minimum spacing between calls, shared by every caller holding the same `Arc`.
///
/// The lock is held while waiting, so concurrent callers queue up and leave
/// one interval apart instead of all sleeping the same interval in parallel.
pub struct Throttle {
    min_interval: Duration,
    last: AsyncMutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: AsyncMutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }
}

/// `"{address}|{city}"` → coordinates, mirrored to a JSON file on every insert.
pub struct GeoCache {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, Coordinates>>,
    persist_failures: AtomicUsize,
}

impl GeoCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
            persist_failures: AtomicUsize::new(0),
        }
    }

    /// Loads the cache file, creating an empty one when missing. An unreadable
    /// file starts an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = if path.exists() {
            match fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()))
            {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable geocode cache");
                    BTreeMap::new()
                }
            }
        } else {
            if let Err(err) = utils::ensure_parent(&path).and_then(|_| fs::write(&path, "{}")) {
                tracing::warn!(path = %path.display(), error = %err, "unable to create geocode cache");
            }
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "geocode cache loaded");
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
            persist_failures: AtomicUsize::new(0),
        }
    }

    pub fn key(address: Option<&str>, city: Option<&str>) -> String {
        format!("{}|{}", address.unwrap_or_default(), city.unwrap_or_default())
    }

    pub fn get(&self, key: &str) -> Option<Coordinates> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
    }

    pub fn insert(&self, key: String, coords: Coordinates) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key, coords);
        if let Some(path) = &self.path {
            if let Err(err) = write_cache(path, &entries) {
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(path = %path.display(), error = %err, "failed to persist geocode cache");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many writes failed to reach disk so far.
    pub fn persist_failures(&self) -> usize {
        self.persist_failures.load(Ordering::Relaxed)
    }
}

fn write_cache(path: &Path, entries: &BTreeMap<String, Coordinates>) -> anyhow::Result<()> {
    utils::ensure_parent(path)?;
    let contents = serde_json::to_string(entries)?;
    fs::write(path, contents)?;
    Ok(())
}

pub struct CachedGeocoder {
    lookup: Arc<dyn GeocodeLookup>,
    throttle: Arc<Throttle>,
    cache: GeoCache,
    timeout: Duration,
}

impl CachedGeocoder {
    pub fn new(
        lookup: Arc<dyn GeocodeLookup>,
        throttle: Arc<Throttle>,
        cache: GeoCache,
        timeout: Duration,
    ) -> Self {
        Self {
            lookup,
            throttle,
            cache,
            timeout,
        }
    }

    pub fn from_config(config: &HarvestConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.geocode_timeout_secs);
        let lookup = NominatimLookup::new(&config.geocode_endpoint, &config.geocode_user_agent, timeout)?;
        Ok(Self::new(
            Arc::new(lookup),
            Arc::new(Throttle::new(Duration::from_millis(config.geocode_min_delay_ms))),
            GeoCache::open(&config.geocode_cache_path),
            timeout,
        ))
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }
}

fn query_for(address: Option<&str>, city: Option<&str>) -> String {
    [address, city, Some(COUNTRY)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl Geocoder for CachedGeocoder {
    async fn geocode(&self, address: Option<&str>, city: Option<&str>) -> Option<Coordinates> {
        let address = address.filter(|a| !a.trim().is_empty());
        let city = city.filter(|c| !c.trim().is_empty());
        if address.is_none() && city.is_none() {
            return None;
        }

        let key = GeoCache::key(address, city);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(%key, "geocode cache hit");
            return Some(hit);
        }

        let query = query_for(address, city);
        self.throttle.acquire().await;
        match timeout(self.timeout, self.lookup.lookup(&query)).await {
            Ok(Ok(Some(coords))) => {
                self.cache.insert(key, coords);
                Some(coords)
            }
            Ok(Ok(None)) => {
                tracing::debug!(%query, "no geocode match");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(%query, error = %err, "geocode lookup failed");
                None
            }
            Err(_) => {
                tracing::warn!(%query, "geocode lookup timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingLookup;

    fn geocoder(lookup: Arc<CountingLookup>, cache: GeoCache) -> CachedGeocoder {
        CachedGeocoder::new(
            lookup,
            Arc::new(Throttle::new(Duration::ZERO)),
            cache,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn query_joins_present_parts_with_country() {
        assert_eq!(
            query_for(Some("ул. Ленина, 1"), Some("Минск")),
            "ул. Ленина, 1, Минск, Belarus"
        );
        assert_eq!(query_for(None, Some("Гродно")), "Гродно, Belarus");
        assert_eq!(GeoCache::key(None, Some("Гродно")), "|Гродно");
    }

    #[tokio::test]
    async fn repeated_lookups_hit_the_cache() {
        let lookup = Arc::new(CountingLookup::answering(Some((53.9, 27.56))));
        let geo = geocoder(lookup.clone(), GeoCache::in_memory());

        for _ in 0..3 {
            assert_eq!(geo.geocode(Some("пр. Победителей, 65"), Some("Минск")).await, Some((53.9, 27.56)));
        }
        assert_eq!(lookup.calls(), 1);
        assert_eq!(lookup.queries(), vec!["пр. Победителей, 65, Минск, Belarus".to_string()]);
    }

    #[tokio::test]
    async fn absent_inputs_never_reach_the_lookup() {
        let lookup = Arc::new(CountingLookup::answering(Some((1.0, 2.0))));
        let geo = geocoder(lookup.clone(), GeoCache::in_memory());

        assert_eq!(geo.geocode(None, None).await, None);
        assert_eq!(geo.geocode(Some("  "), Some("")).await, None);
        assert_eq!(lookup.calls(), 0);
        assert!(geo.cache().is_empty());
    }

    #[tokio::test]
    async fn misses_and_failures_are_not_cached() {
        let lookup = Arc::new(CountingLookup::failing());
        let geo = geocoder(lookup.clone(), GeoCache::in_memory());

        assert_eq!(geo.geocode(Some("Нигде"), None).await, None);
        assert_eq!(geo.geocode(Some("Нигде"), None).await, None);
        assert_eq!(lookup.calls(), 2);
        assert!(geo.cache().is_empty());
    }

    #[tokio::test]
    async fn no_match_is_not_cached() {
        let lookup = Arc::new(CountingLookup::answering(None));
        let geo = geocoder(lookup.clone(), GeoCache::in_memory());

        assert_eq!(geo.geocode(Some("ул. Несуществующая, 99"), Some("Минск")).await, None);
        assert_eq!(geo.geocode(Some("ул. Несуществующая, 99"), Some("Минск")).await, None);
        assert_eq!(lookup.calls(), 2);
        assert!(geo.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_lookup_is_retried_next_time() {
        let lookup = Arc::new(CountingLookup::stalling_once(
            Some((1.0, 2.0)),
            Duration::from_secs(60),
        ));
        let geo = geocoder(lookup.clone(), GeoCache::in_memory());

        let started = tokio::time::Instant::now();
        assert_eq!(geo.geocode(Some("ул. Кирова, 5"), Some("Гомель")).await, None);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(geo.cache().is_empty());

        assert_eq!(geo.geocode(Some("ул. Кирова, 5"), Some("Гомель")).await, Some((1.0, 2.0)));
        assert_eq!(lookup.calls(), 2);
        assert_eq!(geo.cache().len(), 1);
    }

    #[tokio::test]
    async fn disabled_geocoder_returns_nothing() {
        assert_eq!(DisabledGeocoder.geocode(Some("ул. Ленина, 1"), Some("Минск")).await, None);
    }

    #[tokio::test]
    async fn cache_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/geocache.json");

        let cache = GeoCache::open(&path);
        assert!(path.exists(), "empty cache file is created");
        let lookup = Arc::new(CountingLookup::answering(Some((52.1, 23.7))));
        let geo = geocoder(lookup.clone(), cache);
        geo.geocode(Some("ул. Советская, 2"), Some("Брест")).await;

        let reloaded = GeoCache::open(&path);
        assert_eq!(reloaded.get("ул. Советская, 2|Брест"), Some((52.1, 23.7)));
        assert_eq!(geo.cache().persist_failures(), 0);
    }

    #[test]
    fn corrupt_cache_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geocache.json");
        fs::write(&path, "[not a map").unwrap();
        assert!(GeoCache::open(&path).is_empty());
    }

    #[test]
    fn persistence_failures_are_counted_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every write fail.
        let path = dir.path().join("geocache.json");
        fs::create_dir(&path).unwrap();
        let cache = GeoCache {
            path: Some(path),
            entries: Mutex::new(BTreeMap::new()),
            persist_failures: AtomicUsize::new(0),
        };

        cache.insert("a|b".into(), (1.0, 2.0));
        assert_eq!(cache.get("a|b"), Some((1.0, 2.0)));
        assert_eq!(cache.persist_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_throttle() {
        let lookup = Arc::new(CountingLookup::answering(Some((53.0, 27.0))));
        let geo = Arc::new(CachedGeocoder::new(
            lookup.clone(),
            Arc::new(Throttle::new(Duration::from_millis(1200))),
            GeoCache::in_memory(),
            Duration::from_secs(10),
        ));

        let started = Instant::now();
        let cities = ["Минск", "Брест", "Гродно", "Гомель"];
        let tasks = cities.iter().map(|city| {
            let geo = geo.clone();
            async move { geo.geocode(None, Some(city)).await }
        });
        let results = futures::future::join_all(tasks).await;

        assert!(results.iter().all(Option::is_some));
        assert_eq!(lookup.calls(), 4);
        let elapsed = started.elapsed();
        // First call is immediate, the other three wait one interval each.
        assert!(elapsed >= Duration::from_millis(3600) && elapsed < Duration::from_millis(3700));
    }
}
