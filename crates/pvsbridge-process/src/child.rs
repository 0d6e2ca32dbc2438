//! Managed engine child process

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use crate::{
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// How long a killed process may take to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Piped standard streams of a spawned engine
pub struct ChildStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Wrapper around `tokio::process::Child` with lifecycle management
pub struct ManagedChild {
    child: Child,
    config: ProcessConfig,
    pid: u32,
    exit_status: Option<ExitStatus>,
}

impl ManagedChild {
    pub(crate) fn new(child: Child, config: ProcessConfig, pid: u32) -> Self {
        Self {
            child,
            config,
            pid,
            exit_status: None,
        }
    }

    /// Get process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get process configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Exit status, once the process has been observed to exit
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Take all piped stdio streams at once
    pub fn take_stdio(&mut self) -> Result<ChildStdio> {
        let stdin = self
            .child
            .stdin
            .take()
            .ok_or(ProcessError::StdioUnavailable { stream: "stdin" })?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(ProcessError::StdioUnavailable { stream: "stdout" })?;
        Ok(ChildStdio {
            stdin,
            stdout,
            stderr: self.child.stderr.take(),
        })
    }

    /// Wait for process to exit, bounded by the configured wait timeout
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = match self.config.wait_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.child.wait())
                .await
                .map_err(|_| ProcessError::Timeout {
                    seconds: timeout.as_secs(),
                })??,
            None => self.child.wait().await?,
        };
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Kill the process tree and reap the child.
    ///
    /// Succeeds without doing anything when the process already exited, so
    /// it may be called any number of times.
    pub async fn kill(&mut self) -> Result<()> {
        if !self.is_running() {
            debug!(pid = %self.pid, "Process already exited, nothing to kill");
            return Ok(());
        }

        self.kill_tree().await?;

        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = %self.pid, ?status, "Process reaped");
                self.exit_status = Some(status);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(pid = %self.pid, error = %e, "Error waiting for killed process");
                Err(ProcessError::KillFailed(e.to_string()))
            }
            Err(_) => {
                warn!(pid = %self.pid, "Timeout waiting for killed process");
                Err(ProcessError::Timeout {
                    seconds: REAP_TIMEOUT.as_secs(),
                })
            }
        }
    }

    /// Kill process tree (process and all descendants)
    ///
    /// - Windows: `taskkill /pid <pid> /f /t`
    /// - Unix: SIGTERM to the process group, SIGKILL after the grace period
    async fn kill_tree(&mut self) -> Result<()> {
        debug!(pid = %self.pid, "Killing process tree");

        #[cfg(windows)]
        {
            use tokio::process::Command;

            let mut killer = Command::new("taskkill")
                .args(["/pid", &self.pid.to_string(), "/f", "/t"])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
                .map_err(|e| ProcessError::KillFailed(e.to_string()))?;

            let _ = killer.wait().await;
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if !self.config.own_process_group {
                return self
                    .child
                    .start_kill()
                    .map_err(|e| ProcessError::KillFailed(e.to_string()));
            }

            let pgid = Pid::from_raw(self.pid as i32);

            match killpg(pgid, Signal::SIGTERM) {
                Ok(()) => debug!(pid = %self.pid, "Sent SIGTERM to process group"),
                Err(Errno::ESRCH) => return Ok(()),
                Err(e) => {
                    warn!(pid = %self.pid, error = %e, "SIGTERM failed, killing process only");
                    let _ = self.child.start_kill();
                }
            }

            tokio::time::sleep(self.config.kill_grace).await;
            if !self.is_running() {
                return Ok(());
            }

            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) => debug!(pid = %self.pid, "Sent SIGKILL to process group"),
                Err(Errno::ESRCH) => {}
                Err(e) => {
                    warn!(pid = %self.pid, error = %e, "SIGKILL failed, killing process only");
                    let _ = self.child.start_kill();
                }
            }
        }

        #[allow(unreachable_code)]
        Ok(())
    }
}
