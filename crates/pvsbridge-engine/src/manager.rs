//! Engine process manager
//!
//! Owns every handle: the long-lived parser and typechecker engines, one per
//! role, and transient sessions (provers, evaluators) keyed by handle id.
//! Starting an engine for one role never holds up another role.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::framing::PromptFraming;
use crate::handle::{EngineHandle, EngineRole, HandleSettings, HandleState};
use crate::transport::{EngineLauncher, ProcessLauncher};
use crate::types::EngineResponse;

/// Point-in-time view of one handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleSummary {
    pub id: u64,
    pub role: EngineRole,
    pub state: HandleState,
    pub context: Option<String>,
    pub pid: Option<u32>,
    pub session: bool,
}

impl HandleSummary {
    fn of(handle: &EngineHandle, session: bool) -> Self {
        Self {
            id: handle.id(),
            role: handle.role(),
            state: handle.state(),
            context: handle.context(),
            pid: handle.pid(),
            session,
        }
    }
}

pub struct EngineManager {
    launcher: Arc<dyn EngineLauncher>,
    settings: HandleSettings,
    next_id: AtomicU64,
    long_lived: DashMap<EngineRole, Arc<EngineHandle>>,
    /// Serializes spawning per role
    spawn_gates: DashMap<EngineRole, Arc<Mutex<()>>>,
    sessions: DashMap<u64, Arc<EngineHandle>>,
}

impl EngineManager {
    pub fn new(launcher: Arc<dyn EngineLauncher>, settings: HandleSettings) -> Self {
        Self {
            launcher,
            settings,
            next_id: AtomicU64::new(1),
            long_lived: DashMap::new(),
            spawn_gates: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Manager launching the real engine binary
    pub fn from_config(config: &EngineConfig) -> Self {
        let settings = HandleSettings {
            framing: Arc::new(PromptFraming::new()),
            startup_timeout: config.startup_timeout(),
            command_timeout: config.command_timeout(),
            emacs_interface: config.emacs_interface,
        };
        Self::new(Arc::new(ProcessLauncher::from_config(config)), settings)
    }

    pub fn settings(&self) -> &HandleSettings {
        &self.settings
    }

    /// Start a new engine for `role`. The handle is ready when this returns.
    pub async fn spawn(&self, role: EngineRole) -> Result<Arc<EngineHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(handle = id, %role, "Spawning engine");
        let io = self.launcher.launch(role).await?;
        EngineHandle::start(id, role, io, &self.settings).await
    }

    fn spawn_gate(&self, role: EngineRole) -> Arc<Mutex<()>> {
        self.spawn_gates.entry(role).or_default().clone()
    }

    /// The long-lived handle for `role`, spawned on first use and replaced
    /// once it has crashed or been killed
    pub async fn acquire(&self, role: EngineRole) -> Result<Arc<EngineHandle>> {
        if let Some(handle) = self.current(role).await {
            if !handle.state().is_terminal() {
                return Ok(handle);
            }
        }

        let gate = self.spawn_gate(role);
        let _spawning = gate.lock().await;
        // Another caller may have spawned it while we waited
        if let Some(handle) = self.current(role).await {
            if !handle.state().is_terminal() {
                return Ok(handle);
            }
            info!(handle = handle.id(), %role, state = %handle.state(), "Replacing dead engine");
        }
        let handle = self.spawn(role).await?;
        self.long_lived.insert(role, handle.clone());
        Ok(handle)
    }

    /// The long-lived handle for `role`, if one was ever spawned
    pub async fn current(&self, role: EngineRole) -> Option<Arc<EngineHandle>> {
        self.long_lived.get(&role).map(|entry| entry.value().clone())
    }

    /// Drop the long-lived handle for `role` and spawn a fresh one.
    ///
    /// A crashed handle keeps its CRASHED state; a live one is killed.
    pub async fn respawn(&self, role: EngineRole) -> Result<Arc<EngineHandle>> {
        let gate = self.spawn_gate(role);
        let _spawning = gate.lock().await;
        if let Some((_, old)) = self.long_lived.remove(&role) {
            if !old.state().is_terminal() {
                old.kill().await;
            }
        }
        let handle = self.spawn(role).await?;
        self.long_lived.insert(role, handle.clone());
        Ok(handle)
    }

    /// Switch `handle` to `folder` through its queue
    pub async fn change_context(
        &self,
        handle: &EngineHandle,
        folder: &str,
    ) -> Result<EngineResponse> {
        handle.change_context(folder).await
    }

    /// Kill `handle`; it will never be handed out again
    pub async fn kill(&self, handle: &EngineHandle) {
        self.sessions.remove(&handle.id());
        handle.kill().await;
    }

    /// Spawn a transient handle tracked until `close_session`
    pub async fn open_session(&self, role: EngineRole) -> Result<Arc<EngineHandle>> {
        let handle = self.spawn(role).await?;
        self.sessions.insert(handle.id(), handle.clone());
        Ok(handle)
    }

    pub fn session(&self, id: u64) -> Result<Arc<EngineHandle>> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::Coordination(format!("no open session {id}")))
    }

    /// Most recently opened live session for `role`
    pub fn latest_session(&self, role: EngineRole) -> Option<Arc<EngineHandle>> {
        self.sessions
            .iter()
            .filter(|entry| entry.role() == role && !entry.state().is_terminal())
            .max_by_key(|entry| *entry.key())
            .map(|entry| entry.value().clone())
    }

    /// Kill a session; false if there was none
    pub async fn close_session(&self, id: u64) -> bool {
        match self.sessions.remove(&id) {
            Some((_, handle)) => {
                handle.kill().await;
                true
            }
            None => false,
        }
    }

    pub async fn handles(&self) -> Vec<HandleSummary> {
        let mut summaries: Vec<HandleSummary> = self
            .long_lived
            .iter()
            .map(|entry| HandleSummary::of(entry.value(), false))
            .collect();
        summaries.extend(
            self.sessions
                .iter()
                .map(|entry| HandleSummary::of(entry.value(), true)),
        );
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Kill everything, then bring the parser and typechecker back up
    pub async fn reset(&self) -> Result<()> {
        self.shutdown().await;
        for role in [EngineRole::Parser, EngineRole::Typechecker] {
            if let Err(err) = self.acquire(role).await {
                warn!(%role, error = %err, "Engine did not come back after reset");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Kill every handle
    pub async fn shutdown(&self) {
        let long_lived: Vec<_> = self
            .long_lived
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.long_lived.clear();
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        let count = long_lived.len() + sessions.len();
        futures::future::join_all(long_lived.iter().chain(sessions.iter()).map(|h| h.kill())).await;
        if count > 0 {
            info!(count, "All engines stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeEngine, FakeLauncher};
    use crate::transport::EngineIo;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Fake launcher whose typechecker takes a while to start
    struct SlowTypechecker(FakeLauncher);

    #[async_trait]
    impl EngineLauncher for SlowTypechecker {
        async fn launch(&self, role: EngineRole) -> Result<EngineIo> {
            if role == EngineRole::Typechecker {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.0.launch(role).await
        }
    }

    fn manager(launcher: Arc<FakeLauncher>) -> EngineManager {
        EngineManager::new(launcher, HandleSettings::default())
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_handle() {
        let launcher = Arc::new(FakeLauncher::new(FakeEngine::idle()));
        let manager = manager(launcher.clone());

        let first = manager.acquire(EngineRole::Parser).await.unwrap();
        let second = manager.acquire(EngineRole::Parser).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(launcher.launches(), 1);

        manager.acquire(EngineRole::Typechecker).await.unwrap();
        assert_eq!(launcher.launches(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_startup_does_not_block_other_roles() {
        let manager = Arc::new(EngineManager::new(
            Arc::new(SlowTypechecker(FakeLauncher::new(FakeEngine::idle()))),
            HandleSettings::default(),
        ));

        let typechecker = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(EngineRole::Typechecker).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let parser = tokio::time::timeout(
            Duration::from_millis(200),
            manager.acquire(EngineRole::Parser),
        )
        .await
        .expect("parser waited behind the typechecker startup")
        .unwrap();
        assert_eq!(parser.state(), HandleState::Ready);

        let typechecker = typechecker.await.unwrap().unwrap();
        assert_eq!(
            manager.acquire(EngineRole::Typechecker).await.unwrap().id(),
            typechecker.id()
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_acquire_spawns_once() {
        let launcher = Arc::new(FakeLauncher::new(FakeEngine::idle()));
        let manager = Arc::new(manager(launcher.clone()));

        let (a, b) = tokio::join!(
            manager.acquire(EngineRole::Parser),
            manager.acquire(EngineRole::Parser)
        );
        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(launcher.launches(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_runs_initialization_commands() {
        let launcher = Arc::new(FakeLauncher::new(FakeEngine::idle()));
        let manager = manager(launcher.clone());

        let parser = manager.spawn(EngineRole::Parser).await.unwrap();
        assert_eq!(parser.state(), HandleState::Ready);
        let log = launcher.last_log(EngineRole::Parser).unwrap();
        assert_eq!(
            log.commands(),
            vec![
                "(setq *disable-gc-printout* t)",
                "(setq *pvs-emacs-interface* t)",
            ]
        );

        manager.spawn(EngineRole::Prover).await.unwrap();
        let log = launcher.last_log(EngineRole::Prover).unwrap();
        assert_eq!(log.commands(), vec!["(setq *disable-gc-printout* t)"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquire_replaces_killed_handle() {
        let launcher = Arc::new(FakeLauncher::new(FakeEngine::idle()));
        let manager = manager(launcher.clone());

        let first = manager.acquire(EngineRole::Parser).await.unwrap();
        manager.kill(&first).await;
        assert_eq!(first.state(), HandleState::Killed);

        let second = manager.acquire(EngineRole::Parser).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(second.state(), HandleState::Ready);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_sessions_are_tracked_until_closed() {
        let launcher = Arc::new(FakeLauncher::new(FakeEngine::idle()));
        let manager = manager(launcher);

        let prover = manager.open_session(EngineRole::Prover).await.unwrap();
        assert_eq!(manager.session(prover.id()).unwrap().id(), prover.id());
        assert_eq!(
            manager.latest_session(EngineRole::Prover).map(|h| h.id()),
            Some(prover.id())
        );

        assert!(manager.close_session(prover.id()).await);
        assert!(!manager.close_session(prover.id()).await);
        assert_eq!(prover.state(), HandleState::Killed);
        assert!(matches!(
            manager.session(prover.id()),
            Err(EngineError::Coordination(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_is_a_process_fault() {
        let manager = manager(Arc::new(FakeLauncher::failing()));
        let err = manager.acquire(EngineRole::Parser).await.unwrap_err();
        assert!(err.is_process_fault());
        assert!(manager.handles().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_respawns_long_lived_handles() {
        let launcher = Arc::new(FakeLauncher::new(FakeEngine::idle()));
        let manager = manager(launcher.clone());

        let parser = manager.acquire(EngineRole::Parser).await.unwrap();
        let prover = manager.open_session(EngineRole::Prover).await.unwrap();
        manager.reset().await.unwrap();

        assert_eq!(parser.state(), HandleState::Killed);
        assert_eq!(prover.state(), HandleState::Killed);
        let summaries = manager.handles().await;
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.state == HandleState::Ready && !s.session));
        manager.shutdown().await;
    }
}
