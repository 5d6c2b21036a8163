//! Provisioning of the engine executable

use crate::error::{ForgeError, Result};
use flate2::read::GzDecoder;
use reqwest::Client;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Release archive fetched when no engine binary is present
pub const DEFAULT_ENGINE_URL: &str =
    "https://github.com/Dreamacro/clash/releases/download/v1.16.0/clash-linux-amd64-v1.16.0.gz";

/// Timeout for the archive download in seconds
const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Make sure an executable engine exists at `path`, downloading the gzipped
/// release from `url` when it does not
pub async fn ensure_engine(path: &Path, url: &str) -> Result<()> {
    if path.is_file() {
        info!("clash binary exists: {:?}", path);
        return Ok(());
    }

    info!("downloading clash binary from {}", url);
    let archive = download(url).await?;
    let binary = gunzip(&archive).map_err(|e| ForgeError::EngineDownload {
        url: url.to_string(),
        reason: format!("not a gzip archive: {}", e),
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let partial = path.with_extension("part");
    fs::write(&partial, &binary)?;
    make_executable(&partial)?;
    fs::rename(&partial, path)?;

    info!("installed clash binary at {:?} ({} bytes)", path, binary.len());
    Ok(())
}

async fn download(url: &str) -> Result<Vec<u8>> {
    let failed = |e: reqwest::Error| ForgeError::EngineDownload {
        url: url.to_string(),
        reason: e.to_string(),
    };
    let client = Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()?;
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(failed)?;
    let bytes = response.bytes().await.map_err(failed)?;
    Ok(bytes.to_vec())
}

fn gunzip(archive: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut binary = Vec::new();
    GzDecoder::new(archive).read_to_end(&mut binary)?;
    Ok(binary)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
