//! Local Docker daemon access through the `docker` CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use kiln_common::{KilnError, KilnResult};
use tokio::process::Command;

/// Operations the build pipeline needs from a local daemon.
#[async_trait]
pub trait DockerDaemon: Send + Sync {
    /// Load a docker-load tarball, returning the daemon's report.
    async fn load(&self, tarball: &Path) -> KilnResult<String>;

    /// Apply an additional tag to a loaded image.
    async fn tag(&self, source: &str, target: &str) -> KilnResult<()>;
}

/// [`DockerDaemon`] backed by the `docker` executable.
#[derive(Debug, Clone)]
pub struct DockerClient {
    executable: PathBuf,
    env: HashMap<String, String>,
}

impl DockerClient {
    /// Default executable name, resolved through `PATH`.
    pub const DEFAULT_EXECUTABLE: &'static str = "docker";

    /// Use `executable` with extra environment variables.
    pub fn new(executable: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            executable: executable.into(),
            env,
        }
    }

    /// Whether the executable can be run at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.executable)
            .arg("--version")
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }

    async fn exec(&self, args: &[&str]) -> KilnResult<String> {
        tracing::debug!(executable = %self.executable.display(), ?args, "Running docker");
        let output = Command::new(&self.executable)
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KilnError::Docker {
                message: format!("Failed to run {}: {e}", self.executable.display()),
            })?;

        if !output.status.success() {
            return Err(KilnError::Docker {
                message: format!(
                    "docker {} exited with {}: {}",
                    args.first().copied().unwrap_or_default(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EXECUTABLE, HashMap::new())
    }
}

#[async_trait]
impl DockerDaemon for DockerClient {
    async fn load(&self, tarball: &Path) -> KilnResult<String> {
        let path = tarball.to_string_lossy();
        let report = self.exec(&["load", "--input", &path]).await?;
        tracing::info!(report = %report, "Loaded image into Docker");
        Ok(report)
    }

    async fn tag(&self, source: &str, target: &str) -> KilnResult<()> {
        self.exec(&["tag", source, target]).await?;
        Ok(())
    }
}
