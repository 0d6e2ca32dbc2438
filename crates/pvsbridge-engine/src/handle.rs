//! Engine process handles
//!
//! A handle owns one engine process through its command queue. Its lifecycle
//! is `Unspawned → Spawning → Ready ⇄ Busy`, ending in `Killed` or `Crashed`.
//! Both terminal states are final: a new session needs a new handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::EngineCommand;
use crate::error::{EngineError, Result};
use crate::framing::{PromptFraming, ReplyFraming};
use crate::queue::{CommandQueue, QueueWorker};
use crate::transport::EngineIo;
use crate::types::EngineResponse;

/// What a handle is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineRole {
    /// Long-lived, parses files and answers lookups
    Parser,
    /// Long-lived, typechecks and generates obligations
    Typechecker,
    /// Transient interactive proof session
    Prover,
    /// Transient PVSio evaluation session
    Evaluator,
    /// Transient typechecker used for parallel workspace typechecking
    Worker,
}

impl EngineRole {
    /// Roles that accept the emacs error-reporting mode
    pub fn supports_emacs_interface(&self) -> bool {
        matches!(
            self,
            EngineRole::Parser | EngineRole::Typechecker | EngineRole::Worker
        )
    }
}

impl fmt::Display for EngineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineRole::Parser => "parser",
            EngineRole::Typechecker => "typechecker",
            EngineRole::Prover => "prover",
            EngineRole::Evaluator => "evaluator",
            EngineRole::Worker => "worker",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleState {
    Unspawned,
    Spawning,
    Ready,
    Busy,
    Killed,
    Crashed,
}

impl HandleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandleState::Killed | HandleState::Crashed)
    }

    fn can_transition_to(&self, next: HandleState) -> bool {
        use HandleState::*;
        match (self, next) {
            (Killed, _) => false,
            (_, Killed) => true,
            (Crashed, _) => false,
            (Unspawned, Spawning) => true,
            (Spawning, Ready) | (Spawning, Crashed) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready, Crashed) | (Busy, Crashed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Unspawned => "unspawned",
            HandleState::Spawning => "spawning",
            HandleState::Ready => "ready",
            HandleState::Busy => "busy",
            HandleState::Killed => "killed",
            HandleState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// State shared between a handle, its queue and the queue worker
#[derive(Debug)]
pub struct HandleStatus {
    id: u64,
    role: EngineRole,
    state: RwLock<HandleState>,
    busy: AtomicBool,
    outstanding: AtomicUsize,
}

impl HandleStatus {
    pub(crate) fn new(id: u64, role: EngineRole) -> Self {
        Self {
            id,
            role,
            state: RwLock::new(HandleState::Unspawned),
            busy: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> EngineRole {
        self.role
    }

    pub fn state(&self) -> HandleState {
        *self.state.read()
    }

    /// True exactly while a command is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Submitted requests not yet answered, in flight included
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn transition(&self, next: HandleState) -> bool {
        let mut state = self.state.write();
        if state.can_transition_to(next) {
            debug!(handle = self.id, role = %self.role, from = %*state, to = %next, "Handle state change");
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn terminal_state(&self) -> Option<HandleState> {
        let state = self.state();
        state.is_terminal().then_some(state)
    }

    pub(crate) fn unavailable(&self) -> EngineError {
        EngineError::HandleUnavailable {
            id: self.id,
            state: self.state().to_string(),
        }
    }

    pub(crate) fn begin_command(&self) {
        self.busy.store(true, Ordering::Release);
        self.transition(HandleState::Busy);
    }

    pub(crate) fn end_command(&self) {
        self.busy.store(false, Ordering::Release);
        if self.state() == HandleState::Busy {
            self.transition(HandleState::Ready);
        }
    }

    pub(crate) fn mark_crashed(&self) {
        self.busy.store(false, Ordering::Release);
        if self.transition(HandleState::Crashed) {
            warn!(handle = self.id, role = %self.role, "Engine handle crashed");
        }
    }

    pub(crate) fn mark_killed(&self) {
        self.busy.store(false, Ordering::Release);
        self.transition(HandleState::Killed);
    }

    /// Reserve a slot for a request; `exclusive` fails if anything is pending
    pub(crate) fn reserve(&self, exclusive: bool) -> bool {
        if exclusive {
            if self.is_busy() {
                return false;
            }
            self.outstanding
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            true
        }
    }

    pub(crate) fn release(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// How a handle is brought up
#[derive(Debug, Clone)]
pub struct HandleSettings {
    pub framing: Arc<dyn ReplyFraming>,
    pub startup_timeout: Duration,
    pub command_timeout: Option<Duration>,
    pub emacs_interface: bool,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            framing: Arc::new(PromptFraming::new()),
            startup_timeout: Duration::from_secs(60),
            command_timeout: Some(Duration::from_secs(300)),
            emacs_interface: true,
        }
    }
}

/// One spawned engine process and its serialized command queue
pub struct EngineHandle {
    status: Arc<HandleStatus>,
    queue: CommandQueue,
    context: RwLock<Option<String>>,
    context_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    pid: Option<u32>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("state", &self.state())
            .field("pid", &self.pid)
            .finish()
    }
}

impl EngineHandle {
    /// Attach a queue worker to the streams, wait for the first prompt and
    /// run the initialization commands.
    ///
    /// The worker owns the output stream before anything is written.
    pub async fn start(
        id: u64,
        role: EngineRole,
        io: EngineIo,
        settings: &HandleSettings,
    ) -> Result<Arc<Self>> {
        let status = Arc::new(HandleStatus::new(id, role));
        status.transition(HandleState::Spawning);

        let pid = io.pid();
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = QueueWorker::new(
            io,
            settings.framing.clone(),
            rx,
            status.clone(),
            shutdown.clone(),
            settings.startup_timeout,
            ready_tx,
        );
        let join = tokio::spawn(worker.run());

        let handle = Arc::new(Self {
            queue: CommandQueue::new(tx, status.clone(), settings.command_timeout),
            status,
            context: RwLock::new(None),
            context_lock: Mutex::new(()),
            worker: Mutex::new(Some(join)),
            shutdown,
            pid,
        });

        let startup = match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Crashed(
                "queue worker exited during startup".to_string(),
            )),
        };
        if let Err(err) = startup {
            warn!(handle = id, %role, error = %err, "Engine failed to start");
            handle.kill().await;
            return Err(err);
        }

        if let Err(err) = handle.initialize(settings).await {
            warn!(handle = id, %role, error = %err, "Engine initialization failed");
            handle.kill().await;
            return Err(err);
        }

        handle.status.transition(HandleState::Ready);
        info!(handle = id, %role, pid = ?pid, "Engine ready");
        Ok(handle)
    }

    async fn initialize(&self, settings: &HandleSettings) -> Result<()> {
        let mut commands = vec![EngineCommand::disable_gc_printout()];
        if settings.emacs_interface && self.role().supports_emacs_interface() {
            commands.push(EngineCommand::emacs_interface());
        }
        for command in commands {
            let response = self.queue.execute(command.clone()).await?;
            if let Some(error) = response.error {
                return Err(EngineError::Protocol(format!(
                    "initialization command {} failed: {}",
                    command, error.message
                )));
            }
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.status.id()
    }

    pub fn role(&self) -> EngineRole {
        self.status.role()
    }

    pub fn state(&self) -> HandleState {
        self.status.state()
    }

    pub fn is_busy(&self) -> bool {
        self.status.is_busy()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> &Arc<HandleStatus> {
        &self.status
    }

    /// Last context folder the engine confirmed
    pub fn context(&self) -> Option<String> {
        self.context.read().clone()
    }

    /// Queue a command behind everything already submitted
    pub async fn execute(&self, command: EngineCommand) -> Result<EngineResponse> {
        self.queue.execute(command).await
    }

    /// Run a command only if nothing is in flight or queued
    pub async fn execute_immediate(&self, command: EngineCommand) -> Result<EngineResponse> {
        self.queue.execute_immediate(command).await
    }

    /// Queue a command that can be withdrawn through `cancel`
    pub async fn execute_with_cancel(
        &self,
        command: EngineCommand,
        cancel: CancellationToken,
    ) -> Result<EngineResponse> {
        self.queue.execute_with_cancel(command, cancel).await
    }

    /// Switch the engine's working context.
    ///
    /// Waits for any open context session to end first, so a command running
    /// inside one never sees its folder change underneath it.
    pub async fn change_context(&self, folder: &str) -> Result<EngineResponse> {
        let _guard = self.context_lock.lock().await;
        self.switch_context(folder).await
    }

    /// Caller holds `context_lock`
    pub(crate) async fn switch_context(&self, folder: &str) -> Result<EngineResponse> {
        let folder = normalize_folder(folder);
        let response = self
            .queue
            .execute(EngineCommand::change_context(&folder))
            .await?;
        if response.error.is_none() {
            info!(handle = self.id(), context = %folder, "Context changed");
            *self.context.write() = Some(folder);
        }
        Ok(response)
    }

    /// Hold the handle in `folder` for a sequence of commands.
    ///
    /// Issues one change-context command when the handle's context differs
    /// and none otherwise. Other context sessions on this handle wait until
    /// the returned session is dropped.
    pub async fn enter_context(&self, folder: &str) -> Result<ContextSession<'_>> {
        let guard = self.context_lock.lock().await;
        if let Some(state) = self.status.terminal_state() {
            return Err(EngineError::HandleUnavailable {
                id: self.id(),
                state: state.to_string(),
            });
        }
        let folder = normalize_folder(folder);
        if self.context().as_deref() != Some(folder.as_str()) {
            let response = self.switch_context(&folder).await?;
            if let Some(error) = response.error {
                return Err(EngineError::Coordination(format!(
                    "cannot change context to {}: {}",
                    folder, error.message
                )));
            }
        }
        Ok(ContextSession {
            handle: self,
            _guard: guard,
        })
    }

    /// Kill the engine. Never fails; repeated calls are no-ops.
    pub async fn kill(&self) {
        self.status.mark_killed();
        self.shutdown.cancel();
        let join = self.worker.lock().await.take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(handle = self.id(), error = %e, "Queue worker did not stop cleanly");
            }
            info!(handle = self.id(), role = %self.role(), "Engine killed");
        }
    }
}

/// Exclusive use of a handle within one context folder
pub struct ContextSession<'a> {
    handle: &'a EngineHandle,
    _guard: MutexGuard<'a, ()>,
}

impl ContextSession<'_> {
    pub fn handle(&self) -> &EngineHandle {
        self.handle
    }

    pub async fn execute(&self, command: EngineCommand) -> Result<EngineResponse> {
        self.handle.execute(command).await
    }
}

/// Context folders are compared without trailing separators
pub fn normalize_folder(folder: &str) -> String {
    let trimmed = folder.trim();
    let stripped = trimmed.trim_end_matches(['/', '\\']);
    if stripped.is_empty() && !trimmed.is_empty() {
        trimmed[..1].to_string()
    } else {
        stripped.to_string()
    }
}
