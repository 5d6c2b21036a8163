//! Subscription retrieval and on-disk caching

use crate::error::{ForgeError, Result};
use crate::Config;
use chrono::{DateTime, Local};
use reqwest::{Client, Url};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts per subscription download
const DOWNLOAD_ATTEMPTS: usize = 3;

/// Timeout for one subscription download in seconds
const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// One clash subscription and its parsed configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub url: String,
    /// Host of the subscription URL
    pub id: String,
    pub config: Mapping,
}

impl Subscription {
    pub fn new(url: &str, config: Mapping) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            id: host_of(url)?,
            config,
        })
    }

    pub fn cache_filename(&self) -> String {
        format!("{}.yaml", self.id)
    }

    /// The `proxies` list, empty when the config has none
    pub fn proxies(&self) -> Vec<Value> {
        self.config
            .get("proxies")
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default()
    }

    pub fn proxy_count(&self) -> usize {
        self.config
            .get("proxies")
            .and_then(Value::as_sequence)
            .map_or(0, |proxies| proxies.len())
    }

    pub fn set_proxies(&mut self, proxies: Vec<Value>) {
        self.config
            .insert(Value::from("proxies"), Value::Sequence(proxies));
    }

    /// Write the config to `<dir>/<host>.yaml`
    pub fn save_cache(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.cache_filename());
        debug!("caching clash configuration {:?}", path);
        fs::write(&path, serde_yaml::to_string(&self.config)?)?;
        Ok(path)
    }
}

/// Host part of a subscription URL
pub fn host_of(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| ForgeError::Subscription {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| ForgeError::Subscription {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })
}

/// Whether a cache entry of `age_days` is still usable; 0 never expires
pub fn is_fresh(age_days: i64, cache_days: u64) -> bool {
    cache_days == 0 || age_days < cache_days as i64
}

fn age_in_days(path: &Path) -> std::io::Result<i64> {
    let modified: DateTime<Local> = fs::metadata(path)?.modified()?.into();
    Ok((Local::now() - modified).num_days())
}

/// Loads subscriptions from cache or network
pub struct SubscriptionLoader {
    client: Client,
    cache_dir: PathBuf,
    use_cache: bool,
    cache_days: u64,
}

impl SubscriptionLoader {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            cache_dir: config.cache_dir.clone(),
            use_cache: config.use_cache,
            cache_days: config.cache_days,
        })
    }

    /// Load from a fresh cache entry when caching is on, otherwise download
    pub async fn load(&self, url: &str) -> Result<Subscription> {
        if self.use_cache {
            if let Some(config) = self.load_cached(url)? {
                return Subscription::new(url, config);
            }
        }
        info!("downloading config from {}", url);
        let config = self.download(url).await?;
        Subscription::new(url, config)
    }

    fn load_cached(&self, url: &str) -> Result<Option<Mapping>> {
        let path = self.cache_dir.join(format!("{}.yaml", host_of(url)?));
        let age = match age_in_days(&path) {
            Ok(age) => age,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("cache config not found, turn to download");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if !is_fresh(age, self.cache_days) {
            info!("unsafe age for {:?}: {} >= {}", path, age, self.cache_days);
            return Ok(None);
        }
        info!("safe age for {:?}: {} < {}", path, age, self.cache_days);

        let config = serde_yaml::from_str(&fs::read_to_string(&path)?)?;
        info!("load config from cache {:?}", path);
        Ok(Some(config))
    }

    async fn download(&self, url: &str) -> Result<Mapping> {
        let mut last_error = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            let body = match response {
                Ok(response) => response.text().await,
                Err(e) => Err(e),
            };
            match body {
                Ok(body) => {
                    return serde_yaml::from_str(&body).map_err(|e| ForgeError::Subscription {
                        url: url.to_string(),
                        reason: format!("not a clash config: {}", e),
                    })
                }
                Err(e) => {
                    debug!("download attempt {} of {} failed: {}", attempt, url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(ForgeError::Subscription {
            url: url.to_string(),
            reason: last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string()),
        })
    }
}
