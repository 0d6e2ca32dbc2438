//! Scripted in-memory engine for tests
//!
//! Speaks the engine's REPL dialect over a `tokio::io::duplex` pipe: prints a
//! banner and a prompt, then answers each command line with the steps the
//! script returns for it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::{EngineError, Result};
use crate::handle::EngineRole;
use crate::transport::{EngineIo, EngineLauncher};

/// One thing the fake engine does in answer to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeStep {
    /// Write text as is
    Output(String),
    Delay(Duration),
    /// Top-level prompt on a new line
    Prompt,
    /// Break-level prompt `[k] pvs(n):` on a new line
    NestedPrompt(u32),
    /// Close the output stream, as if the process died
    Exit,
    /// Stop answering but keep reading input
    Hang,
}

impl FakeStep {
    pub fn output(text: impl Into<String>) -> Self {
        FakeStep::Output(text.into())
    }

    /// Output followed by a prompt
    pub fn reply(text: impl Into<String>) -> Vec<FakeStep> {
        vec![FakeStep::Output(text.into()), FakeStep::Prompt]
    }
}

type Responder = dyn Fn(&str) -> Option<Vec<FakeStep>> + Send + Sync;

/// Commands received by one fake engine, in arrival order
#[derive(Debug, Clone, Default)]
pub struct FakeLog(Arc<Mutex<Vec<String>>>);

impl FakeLog {
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Received commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn push(&self, command: String) {
        self.0.lock().push(command);
    }
}

/// A scripted engine
#[derive(Clone)]
pub struct FakeEngine {
    responder: Arc<Responder>,
    banner: Option<String>,
}

impl FakeEngine {
    /// Engine answering with `responder`; `None` falls back to the defaults
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Option<Vec<FakeStep>> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            banner: Some("PVS Version 7.1.0 (fake)\n".to_string()),
        }
    }

    /// Engine that only knows the default answers
    pub fn idle() -> Self {
        Self::new(|_| None)
    }

    /// Never print the first prompt
    pub fn silent(mut self) -> Self {
        self.banner = None;
        self
    }

    /// Start the engine task and return the bridge's end of the pipe
    pub fn start(&self) -> (EngineIo, FakeLog) {
        let (bridge_side, engine_side) = tokio::io::duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let log = FakeLog::default();
        tokio::spawn(run_engine(
            engine_side,
            self.responder.clone(),
            self.banner.clone(),
            log.clone(),
        ));
        (EngineIo::from_streams(bridge_read, bridge_write), log)
    }
}

fn default_steps(command: &str) -> Vec<FakeStep> {
    if command == ":reset" {
        return vec![FakeStep::Prompt];
    }
    if command.starts_with("(setq") {
        return FakeStep::reply("T");
    }
    if let Some(rest) = command.strip_prefix("(change-context \"") {
        let folder = rest.split('"').next().unwrap_or_default();
        return FakeStep::reply(format!("Context changed to {folder}/\n\"{folder}/\""));
    }
    FakeStep::reply("NIL")
}

async fn run_engine(
    stream: tokio::io::DuplexStream,
    responder: Arc<Responder>,
    banner: Option<String>,
    log: FakeLog,
) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut counter = 1u32;

    match banner {
        Some(banner) => {
            if write
                .write_all(format!("{banner}pvs({counter}): ").as_bytes())
                .await
                .is_err()
            {
                return;
            }
        }
        None => {
            while let Ok(Some(_)) = lines.next_line().await {}
            return;
        }
    }

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }
        log.push(command.clone());
        let steps = responder(&command).unwrap_or_else(|| default_steps(&command));
        for step in steps {
            let text = match step {
                FakeStep::Output(text) => text,
                FakeStep::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                FakeStep::Prompt => {
                    counter += 1;
                    format!("\npvs({counter}): ")
                }
                FakeStep::NestedPrompt(level) => format!("\n[{level}] pvs({counter}): "),
                FakeStep::Exit => return,
                FakeStep::Hang => {
                    while let Ok(Some(_)) = lines.next_line().await {}
                    return;
                }
            };
            if write.write_all(text.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Launcher handing out fake engines; every launch gets a fresh one
pub struct FakeLauncher {
    engine: FakeEngine,
    launches: AtomicUsize,
    logs: Mutex<Vec<(EngineRole, FakeLog)>>,
    fail: bool,
}

impl FakeLauncher {
    pub fn new(engine: FakeEngine) -> Self {
        Self {
            engine,
            launches: AtomicUsize::new(0),
            logs: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Launcher whose every launch fails like a missing binary
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(FakeEngine::idle())
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Logs of every engine launched so far, oldest first
    pub fn logs(&self) -> Vec<(EngineRole, FakeLog)> {
        self.logs.lock().clone()
    }

    /// Log of the most recent engine launched for `role`
    pub fn last_log(&self, role: EngineRole) -> Option<FakeLog> {
        self.logs
            .lock()
            .iter()
            .rev()
            .find(|(r, _)| *r == role)
            .map(|(_, log)| log.clone())
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self, role: EngineRole) -> Result<EngineIo> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EngineError::Process(
                pvsbridge_process::ProcessError::ExecutableNotFound("pvs".to_string()),
            ));
        }
        let (io, log) = self.engine.start();
        self.logs.lock().push((role, log));
        Ok(io)
    }
}
