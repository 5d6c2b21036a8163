//! Staged filtering of subscription proxies
//!
//! Stages always run in this order, each relying on fields the previous one
//! attached:
//! 1. name patterns
//! 2. ingress resolution (empty and non-global addresses dropped)
//! 3. egress probing (unanswered candidates dropped)
//! 4. fingerprint deduplication

use crate::error::Result;
use crate::proxy::dedup::dedupe;
use crate::proxy::models::{Candidate, StageCounters};
use crate::proxy::prober::{EgressProber, LogProgress, ProbeProgress, ProberConfig};
use crate::proxy::resolver::{is_global_ip, IngressResolver};
use serde_yaml::Value;
use tracing::{debug, info, warn};

/// Default number of concurrent DNS lookups
const DEFAULT_RESOLVE_CONCURRENCY: usize = 64;

/// Stage label used when egress probing aborts
pub const EGRESS_STAGE: &str = "egress";

/// Configuration for the filter pipeline
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Name substrings that exclude a proxy; `None` disables the stage
    pub patterns: Option<Vec<String>>,
    /// Concurrent DNS lookups
    pub resolve_concurrency: usize,
    /// Egress probing settings
    pub prober: ProberConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            patterns: None,
            resolve_concurrency: DEFAULT_RESOLVE_CONCURRENCY,
            prober: ProberConfig::default(),
        }
    }
}

impl FilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn with_resolve_concurrency(mut self, concurrency: usize) -> Self {
        self.resolve_concurrency = concurrency;
        self
    }

    pub fn with_prober(mut self, prober: ProberConfig) -> Self {
        self.prober = prober;
        self
    }
}

/// Runs the filtering stages over one subscription's proxies
pub struct FilterPipeline {
    patterns: Vec<String>,
    resolver: IngressResolver,
    prober: EgressProber,
    counters: StageCounters,
}

impl FilterPipeline {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            patterns: config.patterns.unwrap_or_default(),
            resolver: IngressResolver::with_concurrency(config.resolve_concurrency),
            prober: EgressProber::with_config(config.prober),
            counters: StageCounters::new(),
        }
    }

    /// Survivor counts of the last run
    pub fn counters(&self) -> &StageCounters {
        &self.counters
    }

    /// Filter raw proxy entries, logging egress progress
    pub async fn filter(&mut self, proxies: Vec<Value>) -> Result<Vec<Value>> {
        let mut progress = LogProgress::new();
        self.filter_with_progress(proxies, &mut progress).await
    }

    /// Filter raw proxy entries, reporting egress progress to `progress`.
    ///
    /// Entries come back unmodified. An `Err` means the run failed, as
    /// opposed to an empty list where nothing survived.
    pub async fn filter_with_progress(
        &mut self,
        proxies: Vec<Value>,
        progress: &mut dyn ProbeProgress,
    ) -> Result<Vec<Value>> {
        self.counters.clear();
        self.counters.record("init", proxies.len());

        let candidates = self.parse(proxies);
        let candidates = self.filter_by_patterns(candidates);
        let candidates = self.filter_by_ingress_ip(candidates).await;
        let candidates = self
            .filter_by_egress_ip(candidates, progress)
            .await
            .map_err(|e| e.in_stage(EGRESS_STAGE))?;
        let candidates = self.filter_duplicated(candidates);

        debug!("filtering records:\n{}", self.counters);
        Ok(candidates.into_iter().map(Candidate::into_raw).collect())
    }

    fn parse(&self, proxies: Vec<Value>) -> Vec<Candidate> {
        proxies
            .iter()
            .filter_map(|value| {
                let candidate = Candidate::from_value(value);
                if candidate.is_none() {
                    warn!("skipping malformed proxy entry: {:?}", value);
                }
                candidate
            })
            .collect()
    }

    /// Drop candidates whose name contains any configured pattern
    pub fn filter_by_patterns(&mut self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        if self.patterns.is_empty() {
            return candidates;
        }

        let patterns = &self.patterns;
        let kept: Vec<Candidate> = candidates
            .into_iter()
            .filter(|candidate| {
                match patterns.iter().find(|p| candidate.name().contains(p.as_str())) {
                    Some(pattern) => {
                        debug!("filtered out by pattern {}:\n{}", pattern, candidate);
                        false
                    }
                    None => true,
                }
            })
            .collect();

        self.counters.record("after pattern filtering", kept.len());
        kept
    }

    /// Attach ingress addresses and drop unresolved or non-global ones
    pub async fn filter_by_ingress_ip(&mut self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let servers: Vec<&str> = candidates.iter().map(|c| c.server()).collect();
        let resolved = self.resolver.resolve_all(&servers).await;

        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .zip(resolved)
            .map(|(candidate, ip)| candidate.with_ingress_ip(ip))
            .collect();

        let candidates = self.retain(candidates, |c| c.ingress_ip().is_some(), "empty ingress IP");
        self.retain(
            candidates,
            |c| c.ingress_ip().map(is_global_ip).unwrap_or(false),
            "non-global ingress IP",
        )
    }

    /// Attach egress addresses and drop candidates without one
    pub async fn filter_by_egress_ip(
        &mut self,
        candidates: Vec<Candidate>,
        progress: &mut dyn ProbeProgress,
    ) -> Result<Vec<Candidate>> {
        let candidates = self.prober.probe(candidates, progress).await?;
        Ok(self.retain(candidates, |c| c.egress_ip().is_some(), "empty egress IP"))
    }

    /// Keep one candidate per fingerprint
    pub fn filter_duplicated(&mut self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let kept = dedupe(candidates);
        self.counters.record("after duplication filtering", kept.len());
        kept
    }

    fn retain<F>(&mut self, candidates: Vec<Candidate>, keep: F, reason: &str) -> Vec<Candidate>
    where
        F: Fn(&Candidate) -> bool,
    {
        let (kept, dropped): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|c| keep(c));
        if !dropped.is_empty() {
            debug!(
                "{} proxies are filtered out because of {}:\n{}",
                dropped.len(),
                reason,
                Candidate::describe_all(&dropped)
            );
        }
        info!("{} proxies left after {} filter", kept.len(), reason);
        self.counters.record(format!("after {} filter", reason), kept.len());
        kept
    }
}
