//! Child process lifecycle for the analysis server.
//!
//! Purely mechanical: spawn the server described by a [`ServerLaunch`],
//! hand its piped stdio to the session layer, and kill it if it does not
//! exit within a grace period. The engine does not know or care which
//! concrete tool the descriptor points at.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Descriptor for spawning the analysis-server process.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerLaunch {
    /// Executable name or path (resolved on PATH at spawn time).
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ServerLaunch {
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Spawn the server with piped stdin/stdout.
    ///
    /// Stderr is discarded — servers log freely there and it is not part
    /// of the protocol stream.
    pub fn spawn(&self) -> Result<(ServerProcess, ChildStdin, ChildStdout)> {
        let resolved = which::which(&self.executable)
            .with_context(|| format!("{} not found in PATH", self.executable))?;

        let mut cmd = Command::new(&resolved);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.executable))?;

        let stdin = child.stdin.take().context("no stdin from child")?;
        let stdout = child.stdout.take().context("no stdout from child")?;

        tracing::info!(executable = %resolved.display(), "analysis server spawned");

        Ok((
            ServerProcess {
                name: self.executable.clone(),
                child,
            },
            stdin,
            stdout,
        ))
    }
}

/// Handle to a running server process.
///
/// Dropping it kills the child (`kill_on_drop`); [`ServerProcess::stop`]
/// is the graceful path.
pub struct ServerProcess {
    name: String,
    child: Child,
}

impl ServerProcess {
    /// Wait for the child to exit, sending a platform kill after the
    /// default grace period.
    pub async fn stop(self) {
        self.stop_with_grace(DEFAULT_SHUTDOWN_GRACE).await;
    }

    pub async fn stop_with_grace(mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, error = %e, "waiting on server failed");
            }
            Err(_) => {
                tracing::debug!(server = %self.name, "server didn't exit in time, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_deserializes_with_defaults() {
        let launch: ServerLaunch = serde_json::from_value(serde_json::json!({
            "executable": "pyright-langserver"
        }))
        .unwrap();
        assert_eq!(launch.executable, "pyright-langserver");
        assert!(launch.args.is_empty());
        assert!(launch.working_dir.is_none());
    }

    #[test]
    fn test_launch_builder() {
        let launch = ServerLaunch::new("rust-analyzer")
            .with_args(["--log-file", "/tmp/ra.log"])
            .with_working_dir("/repo");
        assert_eq!(launch.args, vec!["--log-file", "/tmp/ra.log"]);
        assert_eq!(launch.working_dir, Some(PathBuf::from("/repo")));
    }

    #[test]
    fn test_spawn_unknown_executable_fails() {
        let launch = ServerLaunch::new("definitely-not-a-real-language-server");
        assert!(launch.spawn().is_err());
    }
}
