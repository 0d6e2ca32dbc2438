//! Process configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProcessError, Result};

/// Configuration for spawning an engine process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable, either a bare program name or a path
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Environment variables (added to parent env)
    pub env: HashMap<String, String>,
    /// How long `wait` may block before giving up (None = forever)
    pub wait_timeout: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL during tree kill
    pub kill_grace: Duration,
    /// Put the child in its own process group (unix)
    pub own_process_group: bool,
    /// Pipe stderr instead of discarding it
    pub capture_stderr: bool,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            wait_timeout: None,
            kill_grace: Duration::from_millis(200),
            own_process_group: true,
            capture_stderr: true,
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the wait timeout
    pub fn wait_timeout(mut self, duration: Duration) -> Self {
        self.wait_timeout = Some(duration);
        self
    }

    /// Set the SIGTERM to SIGKILL grace period
    pub fn kill_grace(mut self, duration: Duration) -> Self {
        self.kill_grace = duration;
        self
    }

    /// Enable/disable a dedicated process group
    pub fn own_process_group(mut self, enabled: bool) -> Self {
        self.own_process_group = enabled;
        self
    }

    /// Enable/disable stderr capture
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Check the configuration before spawning
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ProcessError::InvalidConfig(
                "command must not be empty".to_string(),
            ));
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                return Err(ProcessError::InvalidConfig(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}
