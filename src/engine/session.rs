//! One ephemeral engine process and its config file

use crate::engine::client::EngineClient;
use crate::engine::config::EngineConfig;
use crate::error::{ForgeError, Result};
use crate::proxy::ports::PortLease;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to wait for the process to exit after it was killed
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Lifecycle of an engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Ready,
    Terminated,
}

/// Owns the engine subprocess and its temporary config.
///
/// Call [`EngineSession::stop`] on every exit path; dropping the session
/// still kills the process and removes the file as a last resort.
#[derive(Debug)]
pub struct EngineSession {
    state: EngineState,
    bin_path: PathBuf,
    config_path: PathBuf,
    mixed_port: u16,
    child: Option<Child>,
    client: EngineClient,
}

impl EngineSession {
    /// Write the session config to `temp_dir`; the engine is not started yet
    pub fn create(
        bin_path: &Path,
        lease: PortLease,
        proxies: Vec<Value>,
        temp_dir: &Path,
    ) -> Result<Self> {
        let config = EngineConfig::new(lease, proxies);
        let client = EngineClient::new(&config.external_controller)?;
        let config_path = config.write_temp(temp_dir)?;
        info!("creating temp config at {:?}", config_path);

        Ok(Self {
            state: EngineState::Created,
            bin_path: bin_path.to_path_buf(),
            config_path,
            mixed_port: config.mixed_port,
            child: None,
            client,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn client(&self) -> &EngineClient {
        &self.client
    }

    pub fn mixed_port(&self) -> u16 {
        self.mixed_port
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Spawn the engine and poll its controller until it answers
    pub async fn start(&mut self, timeout: Duration, interval: Duration) -> Result<()> {
        if self.state != EngineState::Created {
            return Err(ForgeError::InvalidConfig(format!(
                "engine session cannot start from state {:?}",
                self.state
            )));
        }
        self.state = EngineState::Starting;
        info!("starting engine {:?}", self.bin_path);

        let child = Command::new(&self.bin_path)
            .arg("-f")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ForgeError::EngineSpawn {
                path: self.bin_path.clone(),
                source,
            })?;
        let child = self.child.insert(child);

        let deadline = Instant::now() + timeout;
        loop {
            check_exited(child.try_wait())?;
            if self.client.is_ready().await {
                debug!("engine controller ready at {}", self.client.base());
                self.state = EngineState::Ready;
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ForgeError::EngineNotReady { timeout });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Kill the engine and remove the config file. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("engine kill: {}", e);
            }
            let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
        }
        self.remove_config();
        self.state = EngineState::Terminated;
    }

    fn remove_config(&self) {
        match std::fs::remove_file(&self.config_path) {
            Ok(()) => debug!("removed temp config {:?}", self.config_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove temp config {:?}: {}", self.config_path, e),
        }
    }
}

/// Turn a `try_wait` outcome into an engine error if the process is gone
/// or can no longer be observed
fn check_exited(status: std::io::Result<Option<ExitStatus>>) -> Result<()> {
    match status {
        Ok(None) => Ok(()),
        Ok(Some(status)) => Err(ForgeError::EngineExited {
            status: status.to_string(),
        }),
        Err(e) => Err(ForgeError::EngineExited {
            status: format!("unknown ({})", e),
        }),
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.remove_config();
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable shell script standing in for the engine
    pub(crate) fn fake_engine_bin(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(format!("engine-{}.sh", uuid::Uuid::new_v4()));
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("subforge-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Whether a process with `pid` still exists
    pub(crate) fn is_running(pid: u32) -> bool {
        std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -0 {} 2>/dev/null", pid))
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn lease() -> PortLease {
        PortLease::acquire(30000).unwrap()
    }

    fn yaml_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "yaml").unwrap_or(false))
            .count()
    }

    #[tokio::test]
    async fn test_not_ready_times_out_and_cleans_up() {
        let dir = scratch_dir();
        let bin = fake_engine_bin(&dir, "exec sleep 30");
        let mut session = EngineSession::create(&bin, lease(), Vec::new(), &dir).unwrap();
        assert_eq!(session.state(), EngineState::Created);
        assert_eq!(yaml_files(&dir), 1);

        let err = session
            .start(Duration::from_millis(300), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::EngineNotReady { .. }));
        assert_eq!(session.state(), EngineState::Starting);

        let pid = session.child.as_ref().and_then(|c| c.id()).unwrap();
        assert!(is_running(pid));

        session.stop().await;
        assert!(!is_running(pid));
        assert_eq!(session.state(), EngineState::Terminated);
        assert_eq!(yaml_files(&dir), 0);
        assert!(session.child.is_none());

        // second stop is a no-op
        session.stop().await;
        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let dir = scratch_dir();
        let bin = fake_engine_bin(&dir, "exit 3");
        let mut session = EngineSession::create(&bin, lease(), Vec::new(), &dir).unwrap();

        let err = session
            .start(Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::EngineExited { .. }));
        assert!(err.is_engine_lifecycle());

        session.stop().await;
        assert_eq!(yaml_files(&dir), 0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_unobservable_process_counts_as_exit() {
        assert!(check_exited(Ok(None)).is_ok());

        let err = check_exited(Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "wait failed",
        )))
        .unwrap_err();
        assert!(matches!(err, ForgeError::EngineExited { .. }));
        assert!(err.is_engine_lifecycle());
        assert!(err.to_string().contains("wait failed"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = scratch_dir();
        let bin = dir.join("no-such-engine");
        let mut session = EngineSession::create(&bin, lease(), Vec::new(), &dir).unwrap();

        let err = session
            .start(Duration::from_secs(1), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::EngineSpawn { .. }));

        drop(session);
        assert_eq!(yaml_files(&dir), 0);
        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_engine_receives_config_path() {
        let dir = scratch_dir();
        let marker = dir.join("args.txt");
        let bin = fake_engine_bin(
            &dir,
            &format!("echo \"$@\" > {}\nexec sleep 30", marker.display()),
        );
        let mut session = EngineSession::create(&bin, lease(), Vec::new(), &dir).unwrap();
        let config_path = session.config_path().to_path_buf();

        let _ = session
            .start(Duration::from_millis(300), Duration::from_millis(50))
            .await;
        session.stop().await;

        let args = fs::read_to_string(&marker).unwrap();
        assert_eq!(args.trim(), format!("-f {}", config_path.display()));
        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_cannot_start_twice() {
        let dir = scratch_dir();
        let bin = fake_engine_bin(&dir, "exit 0");
        let mut session = EngineSession::create(&bin, lease(), Vec::new(), &dir).unwrap();
        session.stop().await;

        let err = session
            .start(Duration::from_millis(100), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConfig(_)));
        fs::remove_dir_all(dir).unwrap();
    }
}
