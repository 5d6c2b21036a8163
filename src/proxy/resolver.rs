//! Ingress address resolution

use futures::stream::{self, StreamExt};
use ipnet::IpNet;
use once_cell::sync::Lazy;
use std::net::IpAddr;
use tracing::debug;

/// Default number of concurrent DNS lookups
const DEFAULT_CONCURRENCY: usize = 64;

/// Networks that are never reachable from the public internet
static NON_GLOBAL_NETS: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "::/128",
        "::1/128",
        "64:ff9b:1::/48",
        "100::/64",
        "2001::/23",
        "2001:db8::/32",
        "2002::/16",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .iter()
    .map(|net| net.parse().expect("Invalid reserved network literal"))
    .collect()
});

/// Globally routable blocks carved out of the reserved ranges above
static GLOBAL_EXCEPTIONS: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        "192.0.0.9/32",
        "192.0.0.10/32",
        "2001:1::1/128",
        "2001:1::2/128",
        "2001:3::/32",
        "2001:4:112::/48",
        "2001:20::/28",
        "2001:30::/28",
    ]
    .iter()
    .map(|net| net.parse().expect("Invalid global network literal"))
    .collect()
});

/// Whether `ip` is a globally routable address
pub fn is_global_ip(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    GLOBAL_EXCEPTIONS.iter().any(|net| net.contains(&ip))
        || !NON_GLOBAL_NETS.iter().any(|net| net.contains(&ip))
}

/// Resolves candidate server names to addresses
#[derive(Debug, Clone)]
pub struct IngressResolver {
    concurrency: usize,
}

impl IngressResolver {
    pub fn new() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Resolve a host name or IP literal.
    ///
    /// IP literals come back as-is without touching the network. A failed
    /// lookup yields `None`.
    pub async fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }

        match tokio::net::lookup_host((host, 0)).await {
            Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
            Err(e) => {
                debug!("lookup of {} failed: {}", host, e);
                None
            }
        }
    }

    /// Resolve a batch concurrently; the output is aligned with the input
    pub async fn resolve_all<S: AsRef<str>>(&self, hosts: &[S]) -> Vec<Option<IpAddr>> {
        stream::iter(hosts)
            .map(|host| self.resolve(host.as_ref()))
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

impl Default for IngressResolver {
    fn default() -> Self {
        Self::new()
    }
}
