//! Process manager - resolving and spawning engine binaries

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    child::ManagedChild,
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// Spawns engine processes
#[derive(Debug, Default, Clone)]
pub struct ProcessManager;

impl ProcessManager {
    /// Create new process manager
    pub fn new() -> Self {
        Self
    }

    /// Resolve the configured command to an executable path.
    ///
    /// Commands containing a path separator must exist as given; bare names
    /// are looked up on `PATH`.
    pub fn resolve_program(&self, command: &str) -> Result<PathBuf> {
        let path = Path::new(command);
        if path.components().count() > 1 {
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            return Err(ProcessError::ExecutableNotFound(command.to_string()));
        }
        which::which(command).map_err(|_| ProcessError::ExecutableNotFound(command.to_string()))
    }

    /// Spawn a managed process with piped stdin/stdout
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ManagedChild> {
        config.validate()?;
        let program = self.resolve_program(&config.command)?;

        debug!(
            program = %program.display(),
            args = ?config.args,
            "Spawning process"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&config.args);

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(if config.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        if config.own_process_group {
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            ProcessError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Failed to get process ID",
            ))
        })?;

        info!(pid = %pid, program = %program.display(), "Process spawned");

        Ok(ManagedChild::new(child, config, pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_missing_path() {
        let manager = ProcessManager::new();
        assert!(matches!(
            manager.resolve_program("/no/such/dir/pvs"),
            Err(ProcessError::ExecutableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let manager = ProcessManager::new();
        let result = manager
            .spawn(ProcessConfig::new("pvsbridge-no-such-binary"))
            .await;
        assert!(matches!(result, Err(ProcessError::ExecutableNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_echo() {
        let manager = ProcessManager::new();
        let config = ProcessConfig::new("echo").args(["hello"]);

        let mut child = manager.spawn(config).await.unwrap();
        assert!(child.pid() > 0);
        child.wait().await.unwrap();
    }
}
