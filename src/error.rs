use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for subforge
#[derive(Error, Debug)]
pub enum ForgeError {
    // Resource errors
    #[error("No free TCP ports at or above {start}")]
    PortsExhausted { start: u16 },

    // Engine lifecycle errors
    #[error("Failed to spawn engine {path:?}: {source}")]
    EngineSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine did not become ready within {timeout:?}")]
    EngineNotReady { timeout: Duration },

    #[error("Engine exited before becoming ready: {status}")]
    EngineExited { status: String },

    #[error("Failed to select {proxy} in group {group} (status {status})")]
    SelectFailed {
        group: String,
        proxy: String,
        status: String,
    },

    // Pipeline errors
    #[error("Stage `{stage}` failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<ForgeError>,
    },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Outer collaborators
    #[error("Subscription {url}: {reason}")]
    Subscription { url: String, reason: String },

    #[error("Template {path:?}: {reason}")]
    Template { path: PathBuf, reason: String },

    #[error("Failed to download engine from {url}: {reason}")]
    EngineDownload { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for subforge operations
pub type Result<T> = std::result::Result<T, ForgeError>;

impl ForgeError {
    /// Wrap a fatal error with the label of the stage it aborted
    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            already @ ForgeError::Stage { .. } => already,
            other => ForgeError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through stage wrappers
    pub fn root(&self) -> &ForgeError {
        match self {
            ForgeError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error means the shared engine session became unusable
    pub fn is_engine_lifecycle(&self) -> bool {
        matches!(
            self.root(),
            ForgeError::EngineSpawn { .. }
                | ForgeError::EngineNotReady { .. }
                | ForgeError::EngineExited { .. }
                | ForgeError::SelectFailed { .. }
        )
    }

    /// Label of the stage that failed, if the error was raised inside the pipeline
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            ForgeError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
