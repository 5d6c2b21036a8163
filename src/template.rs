//! Merging filtered proxies into output templates

use crate::error::{ForgeError, Result};
use crate::subscription::Subscription;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// A clash config whose proxy list and groups get filled in
#[derive(Debug, Clone)]
pub struct Template {
    path: PathBuf,
    config: Mapping,
}

impl Template {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading template from {:?}", path);
        let text = fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&text).map_err(|e| ForgeError::Template {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_mapping(path, config))
    }

    pub fn from_mapping(path: impl Into<PathBuf>, config: Mapping) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Put every subscription's proxies into the template.
    ///
    /// Groups without a `proxies` key get all proxy names; groups that have
    /// one get the names appended.
    pub fn fit(&self, subscriptions: &[Subscription]) -> Result<Mapping> {
        let proxies: Vec<Value> = subscriptions.iter().flat_map(|s| s.proxies()).collect();
        let names: Vec<Value> = proxies
            .iter()
            .filter_map(|p| p.get("name").cloned())
            .collect();

        let mut config = self.config.clone();
        config.insert(Value::from("proxies"), Value::Sequence(proxies));

        let Some(groups) = config.get_mut("proxy-groups") else {
            return Ok(config);
        };
        let groups = groups
            .as_sequence_mut()
            .ok_or_else(|| self.invalid("proxy-groups is not a list"))?;

        for group in groups.iter_mut() {
            let group = group
                .as_mapping_mut()
                .ok_or_else(|| self.invalid("proxy group is not a mapping"))?;
            match group.get_mut("proxies") {
                Some(Value::Sequence(existing)) => existing.extend(names.iter().cloned()),
                Some(_) => return Err(self.invalid("proxy group `proxies` is not a list")),
                None => {
                    group.insert(Value::from("proxies"), Value::Sequence(names.clone()));
                }
            }
        }
        Ok(config)
    }

    fn invalid(&self, reason: &str) -> ForgeError {
        ForgeError::Template {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Make sure `path` can receive an output file
pub fn prepare_output(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(ForgeError::InvalidConfig(format!(
            "output path {:?} is a directory",
            path
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let metadata = fs::metadata(path);
    if let Ok(metadata) = metadata {
        if metadata.permissions().readonly() {
            return Err(ForgeError::InvalidConfig(format!(
                "non-writable output path {:?}",
                path
            )));
        }
    }
    Ok(())
}

/// Dump a fitted config as YAML
pub fn save_config(path: &Path, config: &Mapping) -> Result<()> {
    info!("saving config {:?}", path);
    fs::write(path, serde_yaml::to_string(config)?)?;
    Ok(())
}
