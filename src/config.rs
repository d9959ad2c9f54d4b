use std::{env, fs, path::Path, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::utils;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarvestConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub fetch_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub throttle_pause_ms: u64,
    pub max_list_pages: usize,
    pub detail_concurrency: usize,
    pub geocode_endpoint: String,
    pub geocode_user_agent: String,
    pub geocode_min_delay_ms: u64,
    pub geocode_timeout_secs: u64,
    pub geocode_cache_path: PathBuf,
    pub chrome_binary: PathBuf,
    pub render_timeout_secs: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 20,
            fetch_attempts: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 4000,
            throttle_pause_ms: 1500,
            max_list_pages: 5,
            detail_concurrency: 4,
            geocode_endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            geocode_user_agent: "belarus-events-harvester/0.1".to_string(),
            geocode_min_delay_ms: 1200,
            geocode_timeout_secs: 10,
            geocode_cache_path: utils::geocache_path(),
            chrome_binary: PathBuf::from("chromium"),
            render_timeout_secs: 10,
        }
    }
}

impl HarvestConfig {
    /// Reads `path` (or the default location), then applies environment
    /// overrides. A missing file means defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(utils::config_path);
        let mut config = read_config(&path)?;
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var("HARVEST_USER_AGENT") {
            self.user_agent = value;
        }
        if let Some(secs) = var("HARVEST_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }
        if let Some(attempts) = var("HARVEST_FETCH_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.fetch_attempts = attempts;
        }
        if let Some(workers) = var("HARVEST_DETAIL_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.detail_concurrency = workers;
        }
        if let Some(endpoint) = var("NOMINATIM_ENDPOINT") {
            self.geocode_endpoint = endpoint;
        }
        if let Some(agent) = var("NOMINATIM_USER_AGENT") {
            self.geocode_user_agent = agent;
        }
        if let Some(path) = var("HARVEST_GEOCACHE") {
            self.geocode_cache_path = PathBuf::from(path);
        }
        if let Some(binary) = var("CHROME_BIN") {
            self.chrome_binary = PathBuf::from(binary);
        }
    }
}

fn read_config(path: &Path) -> anyhow::Result<HarvestConfig> {
    if !path.exists() {
        return Ok(HarvestConfig::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
}
