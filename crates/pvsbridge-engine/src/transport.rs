//! Engine byte streams and how to obtain them

use async_trait::async_trait;
use pvsbridge_process::{ManagedChild, ProcessConfig, ProcessManager};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::handle::EngineRole;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The two ends of an engine REPL plus the process behind them, if any
pub struct EngineIo {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub child: Option<ManagedChild>,
}

impl EngineIo {
    /// Streams with no OS process behind them
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    /// Take the child's pipes; stderr is drained into the log
    pub fn from_child(mut child: ManagedChild) -> Result<Self> {
        let stdio = child.take_stdio()?;
        let pid = child.pid();
        if let Some(stderr) = stdio.stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "pvsbridge::engine::stderr", pid, "{}", line);
                }
            });
        }
        Ok(Self {
            reader: Box::new(stdio.stdout),
            writer: Box::new(stdio.stdin),
            child: Some(child),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(ManagedChild::pid)
    }
}

/// Source of fresh engine streams for a role
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, role: EngineRole) -> Result<EngineIo>;
}

/// Launches the real engine binary
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    manager: ProcessManager,
    process: ProcessConfig,
}

impl ProcessLauncher {
    pub fn new(process: ProcessConfig) -> Self {
        Self {
            manager: ProcessManager::new(),
            process,
        }
    }

    /// `<pvs_path>/<engine_binary> <engine_args...>`
    pub fn from_config(config: &EngineConfig) -> Self {
        let program = config.engine_program();
        let mut process = ProcessConfig::new(program.to_string_lossy())
            .args(config.engine_args.iter().cloned())
            .env("PVSPATH", config.pvs_path.to_string_lossy());
        if config.pvs_path.is_dir() {
            process = process.working_dir(&config.pvs_path);
        }
        Self::new(process)
    }

    pub fn process_config(&self) -> &ProcessConfig {
        &self.process
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self, role: EngineRole) -> Result<EngineIo> {
        debug!(%role, command = %self.process.command, "Launching engine process");
        let child = self.manager.spawn(self.process.clone()).await?;
        EngineIo::from_child(child)
    }
}
