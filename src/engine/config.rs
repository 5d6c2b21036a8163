//! Minimal engine configuration generated for one probing session

use crate::error::Result;
use crate::proxy::ports::PortLease;
use serde::Serialize;
use serde_yaml::Value;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Routing mode of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    #[default]
    Global,
    Rule,
    Direct,
}

/// Engine log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineLogLevel {
    Debug,
    Info,
    #[default]
    Warning,
    Error,
    Silent,
}

/// The document the engine reads at startup
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    pub mixed_port: u16,
    pub external_controller: String,
    pub ipv6: bool,
    pub mode: EngineMode,
    pub log_level: EngineLogLevel,
    pub proxies: Vec<Value>,
}

impl EngineConfig {
    /// Route every proxy through one global selector on the leased ports
    pub fn new(lease: PortLease, proxies: Vec<Value>) -> Self {
        Self {
            mixed_port: lease.mixed,
            external_controller: format!("{}:{}", Ipv4Addr::LOCALHOST, lease.controller),
            ipv6: true,
            mode: EngineMode::Global,
            log_level: EngineLogLevel::Warning,
            proxies,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the config to a uniquely named file inside `dir`
    pub fn write_temp(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("subforge-{}.yaml", uuid::Uuid::new_v4()));
        fs::write(&path, self.to_yaml()?)?;
        Ok(path)
    }
}
