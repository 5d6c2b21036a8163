//! Candidate data models

use serde_yaml::{Mapping, Value};
use std::fmt;
use std::net::IpAddr;

const DESCRIBE_SEPARATOR_WIDTH: usize = 79;

/// One proxy entry from a subscription, plus the addresses observed for it.
///
/// The raw mapping is kept exactly as it came from the subscription and is
/// handed back unchanged by [`Candidate::into_raw`].
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    raw: Mapping,
    name: String,
    server: String,
    ingress_ip: Option<IpAddr>,
    egress_ip: Option<IpAddr>,
}

impl Candidate {
    /// Build a candidate from a raw proxy entry.
    ///
    /// Returns `None` when the entry is not a mapping or lacks a string
    /// `name` or `server`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let raw = value.as_mapping()?.clone();
        let name = raw.get("name")?.as_str()?.to_string();
        let server = raw.get("server")?.as_str()?.to_string();

        Some(Self {
            raw,
            name,
            server,
            ingress_ip: None,
            egress_ip: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn raw(&self) -> &Mapping {
        &self.raw
    }

    pub fn ingress_ip(&self) -> Option<IpAddr> {
        self.ingress_ip
    }

    pub fn egress_ip(&self) -> Option<IpAddr> {
        self.egress_ip
    }

    /// Attach the resolved server address. Written at most once per run.
    pub fn with_ingress_ip(mut self, ip: Option<IpAddr>) -> Self {
        debug_assert!(self.ingress_ip.is_none(), "ingress IP already attached");
        self.ingress_ip = ip;
        self
    }

    /// Attach the observed egress address. Written at most once per run.
    pub fn with_egress_ip(mut self, ip: Option<IpAddr>) -> Self {
        debug_assert!(self.egress_ip.is_none(), "egress IP already attached");
        self.egress_ip = ip;
        self
    }

    /// The dedup key, available once both addresses are known
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        Some(Fingerprint {
            ingress: self.ingress_ip?,
            egress: self.egress_ip?,
        })
    }

    /// Give back the untouched subscription entry
    pub fn into_raw(self) -> Value {
        Value::Mapping(self.raw)
    }

    /// Render a batch of candidates for debug logs
    pub fn describe_all(candidates: &[Candidate]) -> String {
        let sep = format!("\n{}\n", "-".repeat(DESCRIBE_SEPARATOR_WIDTH));
        candidates
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(&sep)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut shown = self.raw.clone();
        let ip_value =
            |ip: Option<IpAddr>| Value::String(ip.map(|ip| ip.to_string()).unwrap_or_default());
        shown.insert(Value::from("ingress-ip"), ip_value(self.ingress_ip));
        shown.insert(Value::from("egress-ip"), ip_value(self.egress_ip));

        match serde_yaml::to_string(&shown) {
            Ok(text) => write!(f, "{}", text.trim_end()),
            Err(_) => write!(f, "{} ({})", self.name, self.server),
        }
    }
}

/// Identity of a physical route: where traffic enters and where it leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub ingress: IpAddr,
    pub egress: IpAddr,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.ingress, self.egress)
    }
}

/// Surviving candidate count per stage, in the order stages ran
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCounters {
    entries: Vec<(String, usize)>,
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: impl Into<String>, count: usize) {
        self.entries.push((stage.into(), count));
    }

    pub fn get(&self, stage: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, count)| *count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(name, count)| (name.as_str(), *count))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for StageCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .iter()
            .map(|(stage, count)| format!("{}: {}", stage, count))
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_candidate_from_value() {
        let value = entry("{name: hk-01, server: hk.example.com, port: 443, type: ss}");
        let candidate = Candidate::from_value(&value).unwrap();
        assert_eq!(candidate.name(), "hk-01");
        assert_eq!(candidate.server(), "hk.example.com");
        assert!(candidate.ingress_ip().is_none());
        assert!(candidate.egress_ip().is_none());
    }

    #[test]
    fn test_candidate_rejects_incomplete_entries() {
        assert!(Candidate::from_value(&entry("{server: 1.1.1.1}")).is_none());
        assert!(Candidate::from_value(&entry("{name: a}")).is_none());
        assert!(Candidate::from_value(&entry("{name: a, server: 443}")).is_none());
        assert!(Candidate::from_value(&entry("[1, 2]")).is_none());
    }

    #[test]
    fn test_into_raw_leaves_entry_untouched() {
        let value = entry("{name: a, server: 8.8.8.8, port: 1080, udp: true}");
        let candidate = Candidate::from_value(&value)
            .unwrap()
            .with_ingress_ip(Some("8.8.8.8".parse().unwrap()))
            .with_egress_ip(Some("1.2.3.4".parse().unwrap()));
        assert_eq!(candidate.into_raw(), value);
    }

    #[test]
    fn test_fingerprint_requires_both_addresses() {
        let value = entry("{name: a, server: 8.8.8.8}");
        let candidate = Candidate::from_value(&value).unwrap();
        assert!(candidate.fingerprint().is_none());

        let candidate = candidate.with_ingress_ip(Some("8.8.8.8".parse().unwrap()));
        assert!(candidate.fingerprint().is_none());

        let candidate = candidate.with_egress_ip(Some("1.2.3.4".parse().unwrap()));
        let fp = candidate.fingerprint().unwrap();
        assert_eq!(fp.ingress.to_string(), "8.8.8.8");
        assert_eq!(fp.egress.to_string(), "1.2.3.4");
        assert_eq!(fp.to_string(), "8.8.8.8 -> 1.2.3.4");
    }

    #[test]
    fn test_display_includes_observed_addresses() {
        let value = entry("{name: a, server: 8.8.8.8}");
        let candidate = Candidate::from_value(&value)
            .unwrap()
            .with_ingress_ip(Some("8.8.8.8".parse().unwrap()));
        let shown = candidate.to_string();
        assert!(shown.contains("ingress-ip: 8.8.8.8"));
        assert!(shown.contains("egress-ip: ''"));
    }

    #[test]
    fn test_stage_counters_keep_order() {
        let mut counters = StageCounters::new();
        counters.record("init", 5);
        counters.record("after pattern filtering", 3);
        counters.record("after duplication filtering", 2);

        let stages: Vec<_> = counters.iter().map(|(s, _)| s).collect();
        assert_eq!(
            stages,
            vec!["init", "after pattern filtering", "after duplication filtering"]
        );
        assert_eq!(counters.get("after pattern filtering"), Some(3));
        assert_eq!(counters.get("missing"), None);
        assert_eq!(
            counters.to_string(),
            "init: 5\nafter pattern filtering: 3\nafter duplication filtering: 2"
        );

        counters.clear();
        assert!(counters.is_empty());
    }
}
