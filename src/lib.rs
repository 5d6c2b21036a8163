//! Subforge - Clash subscription filter
//!
//! Downloads clash subscriptions, validates every proxy by routing real
//! traffic through an ephemeral engine instance, drops duplicates and
//! merges the survivors into output templates.

pub mod engine;
pub mod error;
pub mod proxy;
pub mod subscription;
pub mod template;

pub use error::{ForgeError, Result};
pub use proxy::*;
pub use subscription::Subscription;
pub use template::Template;

use std::path::PathBuf;

/// Application name, used for the cache directory
pub const APP_NAME: &str = "subforge";

/// Default cache lifetime in days
const DEFAULT_CACHE_DAYS: u64 = 30;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for cached subscriptions and the engine binary
    pub cache_dir: PathBuf,
    /// Read subscriptions from cache when fresh enough
    pub use_cache: bool,
    /// Cache lifetime in days, 0 keeps entries forever
    pub cache_days: u64,
    /// Filtering settings
    pub filter: FilterConfig,
}

impl Default for Config {
    fn default() -> Self {
        let cache_dir = default_cache_dir();
        let prober = ProberConfig::default().with_engine_path(cache_dir.join("clash"));
        Self {
            cache_dir,
            use_cache: false,
            cache_days: DEFAULT_CACHE_DAYS,
            filter: FilterConfig::default().with_prober(prober),
        }
    }
}

/// Per-user cache directory for subforge
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}
