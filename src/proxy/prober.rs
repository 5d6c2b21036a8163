//! Egress probing through an ephemeral engine session

use crate::engine::{DelayProbe, EngineClient, EngineSession};
use crate::error::Result;
use crate::proxy::models::Candidate;
use crate::proxy::ports::{PortLease, DEFAULT_FIRST_PORT};
use reqwest::{Client, Proxy as ReqwestProxy};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, Level};

/// Default engine executable
const DEFAULT_ENGINE_PATH: &str = "clash";

/// Default engine-side delay probe timeout in milliseconds
const DEFAULT_DELAY_TIMEOUT_MS: u64 = 2000;

/// Default URL the engine measures delay against
const DEFAULT_DELAY_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Default endpoint that echoes the caller's address
const DEFAULT_ECHO_URL: &str = "https://icanhazip.com";

/// Default selector group in global mode
const DEFAULT_SELECTOR_GROUP: &str = "GLOBAL";

/// Default timeout for one egress request in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default number of attempts per egress request
const DEFAULT_EGRESS_RETRIES: usize = 3;

/// Default number of concurrent delay probes
const DEFAULT_PING_CONCURRENCY: usize = 64;

/// Configuration for egress probing
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Engine executable
    pub engine_path: PathBuf,
    /// Directory for the session config file
    pub temp_dir: PathBuf,
    /// First port to scan when leasing session ports
    pub first_port: u16,
    /// Total time to wait for the engine controller
    pub ready_timeout: Duration,
    /// Pause between readiness polls
    pub ready_interval: Duration,
    /// Engine-side delay probe timeout in milliseconds
    pub delay_timeout_ms: u64,
    /// URL the engine measures delay against
    pub delay_test_url: String,
    /// Number of delay probe passes; a name reachable in any pass is kept
    pub ping_rounds: usize,
    /// Delay probes in flight at once
    pub ping_concurrency: usize,
    /// Selector group switched for every candidate
    pub selector_group: String,
    /// Endpoint answering with the caller's IP as plain text
    pub echo_url: String,
    /// Timeout for one egress request
    pub request_timeout: Duration,
    /// Attempts per egress request
    pub egress_retries: usize,
    /// Scheme used to reach the engine's mixed port
    pub outbound_scheme: String,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            engine_path: PathBuf::from(DEFAULT_ENGINE_PATH),
            temp_dir: std::env::temp_dir(),
            first_port: DEFAULT_FIRST_PORT,
            ready_timeout: Duration::from_secs(10),
            ready_interval: Duration::from_secs(1),
            delay_timeout_ms: DEFAULT_DELAY_TIMEOUT_MS,
            delay_test_url: DEFAULT_DELAY_TEST_URL.to_string(),
            ping_rounds: 1,
            ping_concurrency: DEFAULT_PING_CONCURRENCY,
            selector_group: DEFAULT_SELECTOR_GROUP.to_string(),
            echo_url: DEFAULT_ECHO_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            egress_retries: DEFAULT_EGRESS_RETRIES,
            outbound_scheme: "socks5".to_string(),
        }
    }
}

impl ProberConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_path = path.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_first_port(mut self, port: u16) -> Self {
        self.first_port = port;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration, interval: Duration) -> Self {
        self.ready_timeout = timeout;
        self.ready_interval = interval;
        self
    }

    pub fn with_delay_test(mut self, timeout_ms: u64, url: String) -> Self {
        self.delay_timeout_ms = timeout_ms;
        self.delay_test_url = url;
        self
    }

    pub fn with_ping_rounds(mut self, rounds: usize) -> Self {
        self.ping_rounds = rounds.max(1);
        self
    }

    pub fn with_echo_url(mut self, url: String) -> Self {
        self.echo_url = url;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_egress_retries(mut self, retries: usize) -> Self {
        self.egress_retries = retries.max(1);
        self
    }

    pub fn with_outbound_scheme(mut self, scheme: &str) -> Self {
        self.outbound_scheme = scheme.to_string();
        self
    }

    fn delay_probe(&self) -> DelayProbe {
        DelayProbe {
            timeout_ms: self.delay_timeout_ms,
            test_url: self.delay_test_url.clone(),
        }
    }
}

/// Observer of the serial egress loop
pub trait ProbeProgress {
    fn on_start(&mut self, _total: usize) {}
    fn on_probed(&mut self, name: &str, egress: Option<IpAddr>);
    fn on_finish(&mut self) {}
}

/// Reports egress progress through the log.
///
/// With debug logging every candidate is reported; otherwise a summary
/// line is written roughly every tenth of the batch.
#[derive(Debug, Default)]
pub struct LogProgress {
    total: usize,
    done: usize,
    found: usize,
    verbose: bool,
}

impl LogProgress {
    pub fn new() -> Self {
        Self {
            verbose: tracing::enabled!(Level::DEBUG),
            ..Default::default()
        }
    }
}

impl ProbeProgress for LogProgress {
    fn on_start(&mut self, total: usize) {
        self.total = total;
        info!("updating egress IPs of {} proxies", total);
    }

    fn on_probed(&mut self, name: &str, egress: Option<IpAddr>) {
        self.done += 1;
        if egress.is_some() {
            self.found += 1;
        }
        if self.verbose {
            let shown = egress.map(|ip| ip.to_string()).unwrap_or_default();
            info!("[egress] {} {}", name, shown);
        } else {
            let step = (self.total / 10).max(1);
            if self.done % step == 0 && self.done < self.total {
                info!("updating egress IPs: {}/{}", self.done, self.total);
            }
        }
    }

    fn on_finish(&mut self) {
        info!(
            "egress IPs updated: {} of {} proxies answered",
            self.found, self.total
        );
    }
}

/// Routes traffic through each candidate and records the address it leaves from
#[derive(Debug, Clone)]
pub struct EgressProber {
    config: ProberConfig,
}

impl EgressProber {
    pub fn new() -> Self {
        Self {
            config: ProberConfig::default(),
        }
    }

    pub fn with_config(config: ProberConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// Probe every candidate through one engine session.
    ///
    /// The returned list has the same order and length as the input, with
    /// egress addresses attached where probing succeeded. Engine failures
    /// abort the whole batch.
    pub async fn probe(
        &self,
        candidates: Vec<Candidate>,
        progress: &mut dyn ProbeProgress,
    ) -> Result<Vec<Candidate>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let lease = PortLease::acquire(self.config.first_port)?;
        let proxies: Vec<Value> = candidates
            .iter()
            .map(|c| Value::Mapping(c.raw().clone()))
            .collect();
        let mut session =
            EngineSession::create(&self.config.engine_path, lease, proxies, &self.config.temp_dir)?;

        let result = self.run_session(&mut session, candidates, progress).await;
        session.stop().await;
        result
    }

    async fn run_session(
        &self,
        session: &mut EngineSession,
        candidates: Vec<Candidate>,
        progress: &mut dyn ProbeProgress,
    ) -> Result<Vec<Candidate>> {
        session
            .start(self.config.ready_timeout, self.config.ready_interval)
            .await?;
        let client = session.client().clone();
        self.probe_through(&client, session.mixed_port(), candidates, progress)
            .await
    }

    /// Delay pre-filter followed by the serial select-and-fetch loop
    pub(crate) async fn probe_through(
        &self,
        client: &EngineClient,
        mixed_port: u16,
        candidates: Vec<Candidate>,
        progress: &mut dyn ProbeProgress,
    ) -> Result<Vec<Candidate>> {
        let reachable = self.reachable_names(client, &candidates).await;
        info!(
            "{} of {} proxies answered the delay probe",
            reachable.len(),
            candidates.len()
        );

        let group = &self.config.selector_group;
        let mut egress: HashMap<String, Option<IpAddr>> = HashMap::new();

        progress.on_start(reachable.len());
        for candidate in &candidates {
            let name = candidate.name();
            if !reachable.contains(name) || egress.contains_key(name) {
                continue;
            }
            client.try_select(group, name).await?;
            // a connection keeps the route it was opened on, so each route
            // gets a client with an empty pool
            let outbound = self.outbound_client(mixed_port)?;
            let ip = self.fetch_egress_ip(&outbound).await;
            progress.on_probed(name, ip);
            egress.insert(name.to_string(), ip);
        }
        progress.on_finish();

        Ok(candidates
            .into_iter()
            .map(|candidate| {
                let ip = egress.get(candidate.name()).copied().flatten();
                candidate.with_egress_ip(ip)
            })
            .collect())
    }

    async fn reachable_names(
        &self,
        client: &EngineClient,
        candidates: &[Candidate],
    ) -> HashSet<String> {
        let names: Vec<String> = candidates.iter().map(|c| c.name().to_string()).collect();
        let probe = self.config.delay_probe();
        let mut reachable = HashSet::new();

        for _ in 0..self.config.ping_rounds.max(1) {
            let results = client
                .ping_all(&names, &probe, self.config.ping_concurrency)
                .await;
            for (name, response) in results {
                if response.is_reachable() {
                    reachable.insert(name);
                } else {
                    debug!(
                        "{} unreachable: {}",
                        name,
                        response.message.unwrap_or_default()
                    );
                }
            }
        }
        reachable
    }

    fn outbound_client(&self, mixed_port: u16) -> Result<Client> {
        let proxy_url = format!("{}://127.0.0.1:{}", self.config.outbound_scheme, mixed_port);
        let client = Client::builder()
            .proxy(ReqwestProxy::all(&proxy_url)?)
            .pool_max_idle_per_host(0)
            .timeout(self.config.request_timeout)
            .build()?;
        Ok(client)
    }

    /// Ask the echo endpoint who we are, through the currently selected route
    async fn fetch_egress_ip(&self, client: &Client) -> Option<IpAddr> {
        for attempt in 1..=self.config.egress_retries.max(1) {
            let response = client
                .get(&self.config.echo_url)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            let body = match response {
                Ok(response) => response.text().await,
                Err(e) => Err(e),
            };
            match body {
                Ok(body) => {
                    let text = body.trim();
                    return match text.parse::<IpAddr>() {
                        Ok(ip) => Some(ip),
                        Err(_) => {
                            debug!("echo endpoint answered with a non-address: {:?}", text);
                            None
                        }
                    };
                }
                Err(e) => debug!("egress request attempt {} failed: {}", attempt, e),
            }
        }
        None
    }
}

impl Default for EgressProber {
    fn default() -> Self {
        Self::new()
    }
}
