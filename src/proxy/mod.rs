//! Proxy validation pipeline
//!
//! This module provides functionality for:
//! - Modelling subscription proxies and the addresses observed for them
//! - Leasing free local ports for the engine
//! - Resolving ingress addresses concurrently
//! - Probing egress addresses through the engine, one route at a time
//! - Deduplicating by (ingress, egress) fingerprint
//! - Running all of the above as one filter pipeline

pub mod dedup;
pub mod filter;
pub mod models;
pub mod ports;
pub mod prober;
pub mod resolver;

pub use dedup::dedupe;
pub use filter::{FilterConfig, FilterPipeline};
pub use models::{Candidate, Fingerprint, StageCounters};
pub use ports::{next_free_port, FreePorts, PortLease};
pub use prober::{EgressProber, LogProgress, ProbeProgress, ProberConfig};
pub use resolver::{is_global_ip, IngressResolver};
