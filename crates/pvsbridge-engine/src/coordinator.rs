//! Workspace/context coordinator
//!
//! Turns logical requests (file, theory, formula in a context folder) into
//! engine command sequences. Requests are checked against the file system
//! before any engine is touched, every sequence runs inside one context
//! session on its handle, and a handle that faults mid-sequence is replaced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::EngineCommand;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind, Result};
use crate::handle::{normalize_folder, ContextSession, EngineHandle, EngineRole, HandleState};
use crate::manager::{EngineManager, HandleSummary};
use crate::types::{
    EngineFailure, EnginePayload, EngineResponse, NameInfo, ProofState, PvsRequest,
    TccDescriptor, TccMap, TheoryTccs, VersionInfo,
};
use crate::workspace::{self, ArtifactStore, FileList, TheoryRef};

/// Which engine state the front-end should present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Lisp,
    Prover,
    Evaluator,
}

/// A prover session and its latest state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProofSession {
    pub session: u64,
    #[serde(rename = "proofState")]
    pub proof_state: ProofState,
}

/// Per-file outcome of a folder-wide operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome<T> {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineFailure>,
}

impl<T> FileOutcome<T> {
    fn from_result(file_name: String, result: Result<T>) -> Self {
        match result {
            Ok(value) => Self {
                file_name,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                file_name,
                result: None,
                error: Some(EngineFailure::from(&err)),
            },
        }
    }
}

/// Lift a reply's failure into an error
fn payload(response: EngineResponse) -> Result<EnginePayload> {
    match response.error {
        Some(failure) => Err(EngineError::reported(failure)),
        None => Ok(response.res.unwrap_or(EnginePayload::Unit)),
    }
}

fn unexpected(what: &str, payload: &EnginePayload) -> EngineError {
    EngineError::Protocol(format!("expected {what}, got {payload:?}"))
}

/// Run commands in order, stopping at the first failure; yields the last payload
async fn run_steps(session: &ContextSession<'_>, commands: Vec<EngineCommand>) -> Result<EnginePayload> {
    let mut last = EnginePayload::Unit;
    for command in commands {
        last = payload(session.execute(command).await?)?;
    }
    Ok(last)
}

/// Name the engine knows a file by: bare for `.pvs`, with extension otherwise
fn engine_file_name(request: &PvsRequest) -> String {
    match request.file_extension.as_str() {
        "" | ".pvs" | "pvs" => request.file_name.clone(),
        ext if ext.starts_with('.') => format!("{}{}", request.file_name, ext),
        ext => format!("{}.{}", request.file_name, ext),
    }
}

pub struct WorkspaceCoordinator {
    manager: Arc<EngineManager>,
    artifacts: ArtifactStore,
    pvs_path: PathBuf,
    max_parallel: usize,
}

impl WorkspaceCoordinator {
    pub fn new(manager: Arc<EngineManager>, pvs_path: impl Into<PathBuf>, max_parallel: usize) -> Self {
        Self {
            manager,
            artifacts: ArtifactStore::new(),
            pvs_path: pvs_path.into(),
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(EngineManager::from_config(config)),
            config.pvs_path.clone(),
            config.max_parallel,
        )
    }

    pub fn manager(&self) -> &Arc<EngineManager> {
        &self.manager
    }

    // Request validation; runs before any engine command

    fn context_folder(&self, folder: &str) -> Result<PathBuf> {
        if folder.trim().is_empty() {
            return Err(EngineError::Coordination(
                "context folder is required".to_string(),
            ));
        }
        let path = PathBuf::from(workspace::normalize_context_folder(folder));
        if !path.is_dir() {
            return Err(EngineError::Coordination(format!(
                "context folder {} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }

    fn source_file(&self, request: &PvsRequest) -> Result<(PathBuf, PathBuf)> {
        if request.file_name.trim().is_empty() {
            return Err(EngineError::Coordination("file name is required".to_string()));
        }
        let folder = self.context_folder(&request.context_folder)?;
        let mut normalized = request.clone();
        normalized.context_folder = folder.to_string_lossy().into_owned();
        let path = normalized.file_path();
        if !path.is_file() {
            return Err(EngineError::Coordination(format!(
                "file {} does not exist",
                path.display()
            )));
        }
        Ok((folder, path))
    }

    fn theory_name(request: &PvsRequest) -> Result<&str> {
        request
            .theory_name
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| EngineError::Coordination("theory name is required".to_string()))
    }

    fn formula_name(request: &PvsRequest) -> Result<&str> {
        request
            .formula_name
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| EngineError::Coordination("formula name is required".to_string()))
    }

    fn is_library(&self, path: &Path) -> bool {
        workspace::is_library_file(path, &self.pvs_path)
    }

    // Fault handling

    /// Replace a long-lived handle that crashed during an operation
    async fn recover(&self, handle: &EngineHandle) {
        if handle.state() != HandleState::Crashed {
            return;
        }
        let role = handle.role();
        let current = self.manager.current(role).await;
        if current.map(|h| h.id()) != Some(handle.id()) {
            return;
        }
        warn!(handle = handle.id(), %role, "Replacing crashed engine");
        match self.manager.respawn(role).await {
            Ok(fresh) => info!(handle = fresh.id(), %role, "Fresh engine ready"),
            Err(err) => warn!(%role, error = %err, "Could not spawn replacement engine"),
        }
    }

    /// Kill a transient handle unless it is still usable
    async fn settle_session(&self, handle: &EngineHandle, keep: bool) {
        if !keep || handle.state().is_terminal() {
            self.manager.kill(handle).await;
        }
    }

    /// Run `commands` in `folder` on the long-lived handle for `role`
    async fn run_in_context(
        &self,
        role: EngineRole,
        folder: &Path,
        commands: Vec<EngineCommand>,
    ) -> Result<EnginePayload> {
        let handle = self.manager.acquire(role).await?;
        let result = match handle.enter_context(&folder.to_string_lossy()).await {
            Ok(session) => run_steps(&session, commands).await,
            Err(err) => Err(err),
        };
        self.recover(&handle).await;
        result
    }

    // Operations

    /// Point the parser engine at `folder`
    pub async fn change_context(&self, folder: &str) -> Result<String> {
        let folder = self.context_folder(folder)?;
        let handle = self.manager.acquire(EngineRole::Parser).await?;
        let result = self
            .manager
            .change_context(&handle, &folder.to_string_lossy())
            .await
            .and_then(payload);
        self.recover(&handle).await;
        result?;
        Ok(handle.context().unwrap_or_default())
    }

    /// Folder the parser engine was last switched to, without asking it
    pub async fn tracked_context(&self) -> Option<String> {
        match self.manager.current(EngineRole::Parser).await {
            Some(handle) => handle.context(),
            None => None,
        }
    }

    /// Working directory as reported by the live parser engine.
    ///
    /// Never starts an engine. A reply that names no folder falls back to the
    /// tracked context.
    pub async fn current_context(&self) -> Result<Option<String>> {
        let Some(handle) = self.manager.current(EngineRole::Parser).await else {
            return Ok(None);
        };
        if handle.state().is_terminal() {
            return Ok(handle.context());
        }
        let result = handle
            .execute(EngineCommand::current_context())
            .await
            .and_then(payload);
        self.recover(&handle).await;
        match result? {
            EnginePayload::Text(folder) if !folder.trim().is_empty() => {
                let folder = normalize_folder(&folder);
                if handle.context().as_deref() != Some(folder.as_str()) {
                    debug!(engine = %folder, tracked = ?handle.context(), "Engine reports another context");
                }
                Ok(Some(folder))
            }
            _ => Ok(handle.context()),
        }
    }

    pub async fn parse_file(&self, request: &PvsRequest) -> Result<EnginePayload> {
        let (folder, path) = self.source_file(request)?;
        if self.is_library(&path) {
            debug!(file = %path.display(), "Skipping library file");
            return Ok(EnginePayload::Unit);
        }
        let name = engine_file_name(request);
        self.run_in_context(EngineRole::Parser, &folder, vec![EngineCommand::parse_file(&name)])
            .await
    }

    pub async fn typecheck_file(&self, request: &PvsRequest) -> Result<EnginePayload> {
        let (folder, path) = self.source_file(request)?;
        if self.is_library(&path) {
            return Ok(EnginePayload::Unit);
        }
        let name = engine_file_name(request);
        self.run_in_context(
            EngineRole::Typechecker,
            &folder,
            vec![EngineCommand::typecheck_file(&name)],
        )
        .await
    }

    /// Typecheck the file of `folder` that declares `theory`
    pub async fn typecheck_theory(&self, folder: &str, theory: &str) -> Result<EnginePayload> {
        let theory = theory.trim();
        if theory.is_empty() {
            return Err(EngineError::Coordination("theory name is required".to_string()));
        }
        let folder = self.context_folder(folder)?;
        let theories = workspace::list_context_theories(&folder).await?;
        let file_name = theories.get(theory).ok_or_else(|| {
            EngineError::Coordination(format!(
                "theory {theory} is not declared in {}",
                folder.display()
            ))
        })?;

        let mut request = PvsRequest::new(folder.to_string_lossy(), file_name.clone());
        if !request.file_path().is_file() {
            request.file_extension = ".hpvs".to_string();
        }
        debug!(%theory, file = %request.file_path().display(), "Theory resolved");
        self.typecheck_file(&request).await
    }

    /// Typecheck a file and collect the obligations of every theory in it
    pub async fn typecheck_file_and_show_tccs(&self, request: &PvsRequest) -> Result<TccMap> {
        self.typecheck_with_tccs(request, false).await
    }

    /// Like `typecheck_file_and_show_tccs`, trying to discharge obligations
    pub async fn typecheck_prove(&self, request: &PvsRequest) -> Result<TccMap> {
        self.typecheck_with_tccs(request, true).await
    }

    async fn typecheck_with_tccs(&self, request: &PvsRequest, prove: bool) -> Result<TccMap> {
        let (folder, path) = self.source_file(request)?;
        if self.is_library(&path) {
            return Ok(TccMap::new());
        }
        let theories = workspace::list_theories(&path).await?;
        let handle = self.manager.acquire(EngineRole::Typechecker).await?;
        let result = self
            .collect_tccs(&handle, &folder, request, &theories, prove)
            .await;
        self.recover(&handle).await;
        result
    }

    /// Obligations for the theory named in the request
    pub async fn show_tccs(&self, request: &PvsRequest) -> Result<TccMap> {
        let (folder, path) = self.source_file(request)?;
        let theory_name = Self::theory_name(request)?;
        let theory = TheoryRef {
            theory_name: theory_name.to_string(),
            file_name: request.file_name.clone(),
            line: 0,
        };
        if self.is_library(&path) {
            return Ok(TccMap::new());
        }
        let handle = self.manager.acquire(EngineRole::Typechecker).await?;
        let result = self
            .collect_tccs(&handle, &folder, request, &[theory], false)
            .await;
        self.recover(&handle).await;
        result
    }

    /// Typecheck, then one show-tccs per theory.
    ///
    /// A theory whose obligations cannot be retrieved gets an entry with no
    /// obligations and an error. After a process fault nothing more is sent
    /// to the handle and the remaining theories are marked not attempted.
    async fn collect_tccs(
        &self,
        handle: &EngineHandle,
        folder: &Path,
        request: &PvsRequest,
        theories: &[TheoryRef],
        prove: bool,
    ) -> Result<TccMap> {
        let name = engine_file_name(request);
        let session = handle.enter_context(&folder.to_string_lossy()).await?;
        let typecheck = if prove {
            EngineCommand::typecheck_prove(&name)
        } else {
            EngineCommand::typecheck_file(&name)
        };
        payload(session.execute(typecheck).await?)?;

        let mut tccs = TccMap::new();
        let mut fault: Option<String> = None;
        for theory in theories {
            let entry = |tccs: Vec<TccDescriptor>, error: Option<EngineFailure>| TheoryTccs {
                theory_name: theory.theory_name.clone(),
                file_name: request.file_name.clone(),
                tccs,
                error,
            };

            if let Some(reason) = &fault {
                let failure = EngineFailure::new(
                    ErrorKind::ProcessFault,
                    format!("not attempted: {reason}"),
                );
                tccs.insert(theory.theory_name.clone(), entry(Vec::new(), Some(failure)));
                continue;
            }

            let response = session
                .execute(EngineCommand::show_tccs(&theory.theory_name))
                .await
                .and_then(payload);
            let theory_tccs = match response {
                Ok(EnginePayload::Tccs(list)) => {
                    if let Err(err) = self
                        .artifacts
                        .write_tccs(folder, &theory.theory_name, &list)
                        .await
                    {
                        warn!(theory = %theory.theory_name, error = %err, "Could not write obligations file");
                    }
                    entry(list, None)
                }
                Ok(other) => entry(
                    Vec::new(),
                    Some(EngineFailure::from(&unexpected("obligations", &other))),
                ),
                Err(err) => {
                    warn!(theory = %theory.theory_name, error = %err, "Obligations unavailable");
                    if err.is_process_fault() {
                        fault = Some(err.to_string());
                    }
                    entry(Vec::new(), Some(EngineFailure::from(&err)))
                }
            };
            tccs.insert(theory.theory_name.clone(), theory_tccs);
        }
        Ok(tccs)
    }

    /// Typecheck every file of a folder, one transient engine per file
    pub async fn typecheck_all(&self, folder: &str) -> Result<BTreeMap<String, FileOutcome<TccMap>>> {
        let folder = self.context_folder(folder)?;
        let files = workspace::list_pvs_files(&folder).await?;
        info!(folder = %folder.display(), files = files.file_names.len(), parallel = self.max_parallel, "Typechecking workspace");

        let outcomes: Vec<FileOutcome<TccMap>> = stream::iter(files.file_names)
            .map(|file| {
                let folder = folder.clone();
                async move {
                    let desc = workspace::normalize_file_name(&file);
                    let mut request = PvsRequest::new(folder.to_string_lossy(), desc.file_name);
                    request.file_extension = desc.file_extension;
                    let result = self.typecheck_on_worker(&folder, &request).await;
                    FileOutcome::from_result(file, result)
                }
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        Ok(outcomes
            .into_iter()
            .map(|outcome| (outcome.file_name.clone(), outcome))
            .collect())
    }

    async fn typecheck_on_worker(&self, folder: &Path, request: &PvsRequest) -> Result<TccMap> {
        let path = request.file_path();
        let theories = workspace::list_theories(&path).await?;
        let handle = self.manager.open_session(EngineRole::Worker).await?;
        let result = self
            .collect_tccs(&handle, folder, request, &theories, false)
            .await;
        self.settle_session(&handle, false).await;
        result
    }

    /// Parse every file of a folder on the parser engine
    pub async fn parse_all(&self, folder: &str) -> Result<BTreeMap<String, FileOutcome<EnginePayload>>> {
        let folder = self.context_folder(folder)?;
        let files = workspace::list_pvs_files(&folder).await?;
        let mut outcomes = BTreeMap::new();
        for file in files.file_names {
            let desc = workspace::normalize_file_name(&file);
            let mut request = PvsRequest::new(folder.to_string_lossy(), desc.file_name);
            request.file_extension = desc.file_extension;
            let result = self.parse_file(&request).await;
            if matches!(&result, Err(err) if err.is_process_fault()) {
                warn!(file = %file, "Parser fault, continuing with a fresh engine");
            }
            outcomes.insert(file.clone(), FileOutcome::from_result(file, result));
        }
        Ok(outcomes)
    }

    pub async fn list_files(&self, folder: &str) -> Result<FileList> {
        let folder = self.context_folder(folder)?;
        workspace::list_pvs_files(&folder).await
    }

    pub async fn list_theories(&self, request: &PvsRequest) -> Result<Vec<TheoryRef>> {
        let (_, path) = self.source_file(request)?;
        workspace::list_theories(&path).await
    }

    pub async fn list_all_theories(&self, folder: &str) -> Result<BTreeMap<String, String>> {
        let folder = self.context_folder(folder)?;
        workspace::list_context_theories(&folder).await
    }

    /// Declarations of `symbol`; `folder` selects the context when given.
    ///
    /// A string literal has no declaration, and `true`/`false` are looked up
    /// by their uppercase names.
    pub async fn find_declaration(&self, folder: Option<&str>, symbol: &str) -> Result<Vec<NameInfo>> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(EngineError::Coordination("symbol is required".to_string()));
        }
        if symbol.len() >= 2 && symbol.starts_with('"') && symbol.ends_with('"') {
            return Ok(Vec::new());
        }
        let symbol = if symbol.eq_ignore_ascii_case("true") || symbol.eq_ignore_ascii_case("false") {
            symbol.to_ascii_uppercase()
        } else {
            symbol.to_string()
        };
        let command = EngineCommand::find_declaration(&symbol);

        let response = match folder {
            Some(folder) => {
                let folder = self.context_folder(folder)?;
                self.run_in_context(EngineRole::Parser, &folder, vec![command])
                    .await?
            }
            None => {
                let handle = self.manager.acquire(EngineRole::Parser).await?;
                let result = handle.execute(command).await.and_then(payload);
                self.recover(&handle).await;
                result?
            }
        };
        match response {
            EnginePayload::Names(names) => Ok(names),
            other => Err(unexpected("declarations", &other)),
        }
    }

    pub async fn names_info(&self, request: &PvsRequest) -> Result<Vec<NameInfo>> {
        let (folder, _) = self.source_file(request)?;
        let name = engine_file_name(request);
        let commands = vec![
            EngineCommand::typecheck_file(&name),
            EngineCommand::names_info(&name),
        ];
        let response = self
            .run_in_context(EngineRole::Typechecker, &folder, commands)
            .await?;
        match response {
            EnginePayload::Names(names) => Ok(names),
            other => Err(unexpected("names", &other)),
        }
    }

    pub async fn list_declarations(&self, request: &PvsRequest) -> Result<Vec<NameInfo>> {
        let (folder, _) = self.source_file(request)?;
        let theory = Self::theory_name(request)?;
        let commands = vec![
            EngineCommand::typecheck_file(&engine_file_name(request)),
            EngineCommand::list_declarations(theory),
        ];
        let response = self
            .run_in_context(EngineRole::Typechecker, &folder, commands)
            .await?;
        match response {
            EnginePayload::Names(names) => Ok(names),
            other => Err(unexpected("declarations", &other)),
        }
    }

    /// Open a prover session on a formula
    pub async fn step_proof(&self, request: &PvsRequest) -> Result<ProofSession> {
        let (folder, _) = self.source_file(request)?;
        let theory = Self::theory_name(request)?;
        let formula = Self::formula_name(request)?;
        self.start_proof(&folder, request, theory, formula, false).await
    }

    /// Open a prover session on an obligation; the formula name is the TCC id
    pub async fn step_tcc(&self, request: &PvsRequest) -> Result<ProofSession> {
        let (folder, _) = self.source_file(request)?;
        let theory = Self::theory_name(request)?;
        let formula = Self::formula_name(request)?;
        self.start_proof(&folder, request, theory, formula, true).await
    }

    async fn start_proof(
        &self,
        folder: &Path,
        request: &PvsRequest,
        theory: &str,
        formula: &str,
        tcc: bool,
    ) -> Result<ProofSession> {
        let handle = self.manager.open_session(EngineRole::Prover).await?;
        let name = engine_file_name(request);
        let mut commands = vec![EngineCommand::typecheck_file(&name)];
        if tcc {
            commands.push(EngineCommand::show_tccs(theory));
        }
        commands.push(EngineCommand::prove_formula(theory, formula));
        let result = match handle.enter_context(&folder.to_string_lossy()).await {
            Ok(session) => run_steps(&session, commands).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(EnginePayload::ProofState(state)) => {
                info!(session = handle.id(), %theory, %formula, "Proof session started");
                let done = state.status.is_some();
                self.settle_session(&handle, !done).await;
                Ok(ProofSession {
                    session: handle.id(),
                    proof_state: *state,
                })
            }
            Ok(other) => {
                self.settle_session(&handle, false).await;
                Err(unexpected("a proof state", &other))
            }
            Err(err) => {
                self.settle_session(&handle, false).await;
                Err(err)
            }
        }
    }

    /// Send a prover command to `session`, or to the newest prover session
    pub async fn proof_command(&self, session: Option<u64>, command: &str) -> Result<ProofSession> {
        if command.trim().is_empty() {
            return Err(EngineError::Coordination("proof command is required".to_string()));
        }
        let handle = match session {
            Some(id) => self.manager.session(id)?,
            None => self
                .manager
                .latest_session(EngineRole::Prover)
                .ok_or_else(|| EngineError::Coordination("no prover session is open".to_string()))?,
        };
        let result = handle
            .execute(EngineCommand::proof_command(command))
            .await
            .and_then(payload);
        match result {
            Ok(EnginePayload::ProofState(state)) => {
                let done = state.status.is_some();
                if done {
                    info!(session = handle.id(), "Proof session finished");
                }
                self.settle_session(&handle, !done).await;
                Ok(ProofSession {
                    session: handle.id(),
                    proof_state: *state,
                })
            }
            Ok(other) => Err(unexpected("a proof state", &other)),
            Err(err) => {
                self.settle_session(&handle, !err.is_process_fault()).await;
                Err(err)
            }
        }
    }

    pub async fn close_session(&self, id: u64) -> Result<()> {
        if self.manager.close_session(id).await {
            Ok(())
        } else {
            Err(EngineError::Coordination(format!("no open session {id}")))
        }
    }

    /// Evaluate a PVSio expression in a theory on a transient evaluator
    pub async fn runit(&self, request: &PvsRequest, expression: &str) -> Result<String> {
        let (folder, _) = self.source_file(request)?;
        let theory = Self::theory_name(request)?;
        if expression.trim().is_empty() {
            return Err(EngineError::Coordination("expression is required".to_string()));
        }
        let handle = self.manager.open_session(EngineRole::Evaluator).await?;
        let name = engine_file_name(request);
        let commands = vec![
            EngineCommand::typecheck_file(&name),
            EngineCommand::load_attachments(),
            EngineCommand::evaluation_mode(theory),
            EngineCommand::eval_expression(expression),
        ];
        let result = match handle.enter_context(&folder.to_string_lossy()).await {
            Ok(session) => run_steps(&session, commands).await,
            Err(err) => Err(err),
        };
        self.settle_session(&handle, false).await;

        match result? {
            EnginePayload::Text(value) => Ok(value),
            other => Err(unexpected("an evaluation result", &other)),
        }
    }

    pub async fn version(&self) -> Result<VersionInfo> {
        let handle = self.manager.acquire(EngineRole::Parser).await?;
        let result = handle.execute(EngineCommand::version()).await.and_then(payload);
        self.recover(&handle).await;
        match result? {
            EnginePayload::Version(version) => Ok(version),
            other => Err(unexpected("version information", &other)),
        }
    }

    /// Raw passthrough to the parser engine
    pub async fn lisp(&self, text: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Err(EngineError::Coordination("command text is required".to_string()));
        }
        let handle = self.manager.acquire(EngineRole::Parser).await?;
        let result = handle.execute(EngineCommand::lisp(text)).await.and_then(payload);
        self.recover(&handle).await;
        match result? {
            EnginePayload::Text(text) => Ok(text),
            other => Err(unexpected("text", &other)),
        }
    }

    /// Remove derived files; `keep_tccs` keeps obligation artifacts
    pub async fn clean(&self, folder: &str, keep_tccs: bool, recursive: bool) -> Result<usize> {
        let folder = self.context_folder(folder)?;
        workspace::clean_bin(&folder, keep_tccs, recursive).await
    }

    /// Make the running parser and typechecker engines forget loaded theories.
    ///
    /// Engines that are not running are left alone; yields how many were cleared.
    pub async fn clear_theories(&self) -> Result<usize> {
        let mut cleared = 0;
        for role in [EngineRole::Parser, EngineRole::Typechecker] {
            let Some(handle) = self.manager.current(role).await else {
                continue;
            };
            if handle.state().is_terminal() {
                continue;
            }
            let result = handle
                .execute(EngineCommand::clear_theories())
                .await
                .and_then(payload);
            self.recover(&handle).await;
            result?;
            cleared += 1;
        }
        Ok(cleared)
    }

    pub async fn mode(&self) -> EngineMode {
        if self.manager.latest_session(EngineRole::Prover).is_some() {
            EngineMode::Prover
        } else if self.manager.latest_session(EngineRole::Evaluator).is_some() {
            EngineMode::Evaluator
        } else {
            EngineMode::Lisp
        }
    }

    pub async fn handles(&self) -> Vec<HandleSummary> {
        self.manager.handles().await
    }

    pub async fn reset(&self) -> Result<()> {
        self.manager.reset().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeEngine, FakeLauncher, FakeStep};
    use crate::handle::HandleSettings;
    use tempfile::TempDir;

    const FOO: &str = "foo_th: THEORY\nBEGIN\n x: posnat = 1\nEND foo_th\n\n\
        bar_th: THEORY\nBEGIN\nEND bar_th\n";

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("foo.pvs"), FOO).unwrap();
        dir
    }

    fn coordinator(engine: FakeEngine) -> (WorkspaceCoordinator, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::new(engine));
        let manager = Arc::new(EngineManager::new(launcher.clone(), HandleSettings::default()));
        (WorkspaceCoordinator::new(manager, "", 2), launcher)
    }

    fn request(dir: &TempDir) -> PvsRequest {
        PvsRequest::new(dir.path().to_string_lossy(), "foo")
    }

    const FOO_TCCS: &str = "((:id \"x_TCC1\" :definition \"1 > 0\" :comment \"subtype TCC\" :from-decl \"x\" :proved nil :theory \"foo_th\"))";

    #[tokio::test]
    async fn test_missing_file_fails_before_any_engine_call() {
        let dir = workspace();
        let (coordinator, launcher) = coordinator(FakeEngine::idle());

        let missing = PvsRequest::new(dir.path().to_string_lossy(), "absent");
        let err = coordinator.parse_file(&missing).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Coordination);

        let no_folder = PvsRequest::new("/definitely/not/here", "foo");
        let err = coordinator.typecheck_file(&no_folder).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Coordination);

        let err = coordinator.show_tccs(&request(&dir)).await.unwrap_err();
        assert!(err.to_string().contains("theory name"));

        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_typecheck_and_show_tccs_writes_artifacts() {
        let dir = workspace();
        let (coordinator, _launcher) = coordinator(FakeEngine::new(|cmd| {
            if cmd.starts_with("(show-tccs \"foo_th\"") {
                Some(FakeStep::reply(FOO_TCCS))
            } else {
                None
            }
        }));

        let tccs = coordinator
            .typecheck_file_and_show_tccs(&request(&dir))
            .await
            .unwrap();
        assert_eq!(tccs.len(), 2);
        assert_eq!(tccs["foo_th"].tccs.len(), 1);
        assert_eq!(tccs["foo_th"].tccs[0].definition, "1 > 0");
        assert!(tccs["bar_th"].tccs.is_empty());
        assert!(tccs["bar_th"].error.is_none());
        assert!(dir.path().join("foo_th.tccs").exists());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_error_on_one_theory_keeps_the_others() {
        let dir = workspace();
        let (coordinator, _launcher) = coordinator(FakeEngine::new(|cmd| {
            if cmd.starts_with("(show-tccs \"foo_th\"") {
                Some(FakeStep::reply(
                    "<pvserror msg=\"Theory foo_th not typechecked\">\n\"detail\"\n</pvserror>",
                ))
            } else if cmd.starts_with("(show-tccs \"bar_th\"") {
                Some(FakeStep::reply(FOO_TCCS))
            } else {
                None
            }
        }));

        let tccs = coordinator
            .typecheck_file_and_show_tccs(&request(&dir))
            .await
            .unwrap();
        let foo = &tccs["foo_th"];
        assert!(foo.tccs.is_empty());
        assert_eq!(foo.error.as_ref().unwrap().kind, ErrorKind::EngineReported);
        assert_eq!(tccs["bar_th"].tccs.len(), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_typecheck_error_is_reported() {
        let dir = workspace();
        let (coordinator, _launcher) = coordinator(FakeEngine::new(|cmd| {
            cmd.starts_with("(typecheck-file").then(|| {
                FakeStep::reply(
                    "<pvserror msg=\"Expecting an expression\">\n\"foo.pvs (line 3, col 14)\"\n</pvserror>",
                )
            })
        }));

        let err = coordinator
            .typecheck_file_and_show_tccs(&request(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineReported);
        assert_eq!(err.to_string(), "Expecting an expression");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_find_declaration_shortcuts() {
        let (coordinator, launcher) = coordinator(FakeEngine::new(|cmd| {
            (cmd == "(find-declaration \"TRUE\")").then(|| {
                FakeStep::reply(
                    "((:declname \"TRUE\" :theoryid \"booleans\" :filename \"prelude.pvs\" :place (10 2 10 6) :decl-ppstring \"TRUE: bool\"))",
                )
            })
        }));

        let none = coordinator.find_declaration(None, "\"hello\"").await.unwrap();
        assert!(none.is_empty());
        assert_eq!(launcher.launches(), 0);

        let found = coordinator.find_declaration(None, "true").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "TRUE");
        assert_eq!(found[0].theory.as_deref(), Some("booleans"));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_proof_session_lifecycle() {
        let dir = workspace();
        let state = "(:label \"x_TCC1\" :current-goal \"1\" :sequent (:succedents ((:labels (\"1\") :changed t :formula \"1 > 0\"))))";
        let (coordinator, _launcher) = coordinator(FakeEngine::new(move |cmd| {
            if cmd.starts_with("(prove-formula") {
                Some(FakeStep::reply(state))
            } else if cmd == "(grind)" {
                Some(FakeStep::reply("Q.E.D."))
            } else {
                None
            }
        }));

        let request = request(&dir).with_theory("foo_th").with_formula("x_TCC1");
        let started = coordinator.step_tcc(&request).await.unwrap();
        assert_eq!(started.proof_state.current_goal.as_deref(), Some("1"));
        assert_eq!(started.proof_state.sequent.succedents[0].formula, "1 > 0");
        assert_eq!(coordinator.mode().await, EngineMode::Prover);

        let finished = coordinator.proof_command(None, "grind").await.unwrap();
        assert_eq!(finished.session, started.session);
        assert_eq!(finished.proof_state.status.as_deref(), Some("proved"));
        assert_eq!(coordinator.mode().await, EngineMode::Lisp);
        assert!(coordinator.close_session(started.session).await.is_err());
    }

    #[tokio::test]
    async fn test_runit_returns_value_and_stops_evaluator() {
        let dir = workspace();
        let (coordinator, launcher) = coordinator(FakeEngine::new(|cmd| {
            (cmd == "x + 1;").then(|| FakeStep::reply("==> 2"))
        }));

        let request = request(&dir).with_theory("foo_th");
        let value = coordinator.runit(&request, "x + 1").await.unwrap();
        assert_eq!(value, "2");
        assert_eq!(coordinator.mode().await, EngineMode::Lisp);

        let log = launcher.last_log(EngineRole::Evaluator).unwrap();
        let commands = log.commands();
        assert_eq!(log.count("(change-context"), 1);
        assert!(commands.iter().any(|c| c == "(load-pvs-attachments)"));
        assert!(commands.iter().any(|c| c.starts_with("(evaluation-mode-pvsio \"foo_th\"")));
    }

    #[tokio::test]
    async fn test_typecheck_all_uses_one_engine_per_file() {
        let dir = workspace();
        std::fs::write(dir.path().join("baz.pvs"), "baz: THEORY BEGIN END baz").unwrap();
        let (coordinator, launcher) = coordinator(FakeEngine::idle());

        let results = coordinator
            .typecheck_all(&dir.path().to_string_lossy())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results["foo.pvs"].result.as_ref().unwrap().contains_key("bar_th"));
        assert!(results["baz.pvs"].error.is_none());
        assert_eq!(launcher.launches(), 2);
        assert!(coordinator.handles().await.is_empty());
    }

    #[tokio::test]
    async fn test_typecheck_theory_uses_the_declaring_file() {
        let dir = workspace();
        std::fs::write(dir.path().join("other.pvs"), "other_th: THEORY\nBEGIN\nEND other_th\n").unwrap();
        std::fs::write(dir.path().join("lib.hpvs"), "lib_th: THEORY\nBEGIN\nEND lib_th\n").unwrap();
        let (coordinator, launcher) = coordinator(FakeEngine::idle());
        let folder = dir.path().to_string_lossy().to_string();

        coordinator.typecheck_theory(&folder, "bar_th").await.unwrap();
        coordinator.typecheck_theory(&folder, "lib_th").await.unwrap();
        let log = launcher.last_log(EngineRole::Typechecker).unwrap();
        assert_eq!(log.count("(typecheck-file \"foo\""), 1);
        assert_eq!(log.count("(typecheck-file \"lib.hpvs\""), 1);
        assert_eq!(log.count("(typecheck-file \"other\""), 0);

        let launches = launcher.launches();
        let err = coordinator
            .typecheck_theory(&folder, "missing_th")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Coordination);
        assert!(err.to_string().contains("missing_th"));
        assert_eq!(log.count("(typecheck-file"), 2);
        assert_eq!(launcher.launches(), launches);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_current_context_asks_the_running_parser() {
        let dir = workspace();
        let (coordinator, launcher) = coordinator(FakeEngine::new(|cmd| {
            (cmd == "(pvs-current-directory)").then(|| FakeStep::reply("\"/srv/ctx/\""))
        }));

        assert_eq!(coordinator.current_context().await.unwrap(), None);
        assert_eq!(launcher.launches(), 0);

        let folder = coordinator
            .change_context(&dir.path().to_string_lossy())
            .await
            .unwrap();
        assert_eq!(coordinator.tracked_context().await, Some(folder));
        assert_eq!(
            coordinator.current_context().await.unwrap(),
            Some("/srv/ctx".to_string())
        );
        let log = launcher.last_log(EngineRole::Parser).unwrap();
        assert_eq!(log.count("(pvs-current-directory)"), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_current_context_falls_back_to_tracked_folder() {
        let dir = workspace();
        let (coordinator, _launcher) = coordinator(FakeEngine::idle());
        let folder = coordinator
            .change_context(&dir.path().to_string_lossy())
            .await
            .unwrap();
        assert_eq!(coordinator.current_context().await.unwrap(), Some(folder));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_theories_only_touches_running_engines() {
        let dir = workspace();
        let (coordinator, launcher) = coordinator(FakeEngine::idle());

        assert_eq!(coordinator.clear_theories().await.unwrap(), 0);
        assert_eq!(launcher.launches(), 0);

        coordinator.parse_file(&request(&dir)).await.unwrap();
        assert_eq!(coordinator.clear_theories().await.unwrap(), 1);
        let log = launcher.last_log(EngineRole::Parser).unwrap();
        assert_eq!(log.count("(clear-theories t)"), 1);
        coordinator.shutdown().await;
    }
}
