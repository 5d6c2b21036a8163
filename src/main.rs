use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use subforge::{
    engine::{ensure_engine, DEFAULT_ENGINE_URL},
    subscription::SubscriptionLoader,
    template::{prepare_output, save_config},
    Config, FilterConfig, FilterPipeline, ProberConfig, Subscription, Template,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Filter clash subscriptions by testing every proxy through a local engine
#[derive(Parser)]
#[command(name = "subforge")]
#[command(about = "Filter clash subscriptions by testing every proxy through a local engine")]
struct Cli {
    /// Subscription URLs
    #[arg(short, long, num_args = 1.., required = true)]
    subscriptions: Vec<String>,

    /// Template paths
    #[arg(short, long, num_args = 1.., required = true)]
    templates: Vec<PathBuf>,

    /// Output paths, one per template
    #[arg(short, long, num_args = 1.., required = true)]
    outputs: Vec<PathBuf>,

    /// Use cached subscriptions instead of downloading them again
    #[arg(short, long)]
    cache: bool,

    /// Cache lifetime in days, 0 for eternal
    #[arg(short, long, default_value = "30")]
    days: u64,

    /// Proxy name patterns for filtering
    #[arg(short, long, num_args = 0..)]
    patterns: Option<Vec<String>>,

    /// Cache directory
    #[arg(long, env = "SUBFORGE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Engine executable (defaults to `clash` inside the cache directory)
    #[arg(long, env = "SUBFORGE_ENGINE")]
    engine: Option<PathBuf>,

    /// Gzipped engine release downloaded when the default engine is missing
    #[arg(long, env = "SUBFORGE_ENGINE_URL", default_value = DEFAULT_ENGINE_URL)]
    engine_url: String,

    /// Seconds to wait for the engine to come up
    #[arg(long, default_value = "10")]
    ready_timeout: u64,

    /// Engine delay probe timeout in milliseconds
    #[arg(long, default_value = "2000")]
    delay_timeout: u64,

    /// Number of delay probe passes
    #[arg(long, default_value = "1")]
    ping_rounds: usize,

    /// Endpoint that echoes the caller's IP address
    #[arg(long, default_value = "https://icanhazip.com")]
    echo_url: String,
}

impl Cli {
    fn config(&self) -> Config {
        let defaults = Config::default();
        let cache_dir = self.cache_dir.clone().unwrap_or(defaults.cache_dir);
        let engine = self
            .engine
            .clone()
            .unwrap_or_else(|| cache_dir.join("clash"));

        let prober = ProberConfig::new()
            .with_engine_path(engine)
            .with_ready_timeout(Duration::from_secs(self.ready_timeout), Duration::from_secs(1))
            .with_delay_test(self.delay_timeout, defaults.filter.prober.delay_test_url)
            .with_ping_rounds(self.ping_rounds)
            .with_echo_url(self.echo_url.clone());

        let mut filter = FilterConfig::new().with_prober(prober);
        if let Some(patterns) = &self.patterns {
            filter = filter.with_patterns(patterns.clone());
        }

        Config {
            cache_dir,
            use_cache: self.cache,
            cache_days: self.days,
            filter,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOGLEVEL")
                .map_err(|e| e.to_string())
                .and_then(|level| {
                    EnvFilter::try_new(format!("subforge={}", level.to_lowercase()))
                        .map_err(|e| e.to_string())
                })
        })
        .unwrap_or_else(|_| EnvFilter::new("subforge=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if cli.templates.len() != cli.outputs.len() {
        bail!(
            "got {} templates but {} outputs",
            cli.templates.len(),
            cli.outputs.len()
        );
    }
    let config = cli.config();

    for output in &cli.outputs {
        prepare_output(output)?;
    }

    let engine = &config.filter.prober.engine_path;
    if cli.engine.is_some() {
        if !engine.is_file() {
            return Err(anyhow!("engine binary not found at {:?}", engine));
        }
        info!("clash binary exists: {:?}", engine);
    } else {
        ensure_engine(engine, &cli.engine_url).await?;
    }

    let loader = SubscriptionLoader::new(&config)?;
    let mut subscriptions: Vec<Subscription> = Vec::new();
    for url in &cli.subscriptions {
        match loader.load(url).await {
            Ok(subscription) => {
                if let Err(e) = subscription.save_cache(&config.cache_dir) {
                    warn!("failed to cache {}: {}", subscription.id, e);
                }
                subscriptions.push(subscription);
            }
            Err(e) => error!("skipping subscription {}: {}", url, e),
        }
    }
    if subscriptions.is_empty() {
        bail!("no subscription could be loaded");
    }

    let mut pipeline = FilterPipeline::new(config.filter.clone());
    let mut filtered = Vec::with_capacity(subscriptions.len());
    for mut subscription in subscriptions {
        info!("start filtering {}", subscription.id);
        let before = subscription.proxy_count();
        match pipeline.filter(subscription.proxies()).await {
            Ok(proxies) => {
                subscription.set_proxies(proxies);
                info!(
                    "change of {}: {} -> {}",
                    subscription.id,
                    before,
                    subscription.proxy_count()
                );
                filtered.push(subscription);
            }
            Err(e) if e.is_engine_lifecycle() => {
                error!("filtering {} failed, dropping it: {}", subscription.id, e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    if filtered.is_empty() {
        bail!("every subscription failed to filter");
    }

    for (template_path, output) in cli.templates.iter().zip(&cli.outputs) {
        let template = Template::load(template_path)?;
        let fitted = template.fit(&filtered)?;
        save_config(output, &fitted)?;
    }

    Ok(())
}
