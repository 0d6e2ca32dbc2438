//! Protocol facade: named operations with JSON params and envelopes
//!
//! Every operation resolves to `{result}` or `{error: {code, message, data}}`;
//! nothing here returns `Err` for a failed request.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::coordinator::{EngineMode, ProofSession, WorkspaceCoordinator};
use crate::error::{EngineError, ErrorKind};
use crate::types::{EngineFailure, PvsRequest};

pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const ENGINE_REPORTED: i32 = -32001;
    pub const PROCESS_FAULT: i32 = -32002;
    pub const COORDINATION: i32 = -32003;
}

/// Operations and their one-line descriptions
pub const METHODS: &[(&str, &str)] = &[
    ("list-methods", "names of the operations this server answers"),
    ("list-client-methods", "callbacks the server may invoke on the client"),
    ("help", "description of one operation or of all of them"),
    ("version", "engine and Lisp versions"),
    ("change-context", "switch the parser engine to a context folder"),
    ("current-context", "context folder of the parser engine"),
    ("list-files", "specification files of a context folder"),
    ("list-theories", "theories declared in a file"),
    ("list-all-theories", "theory to file map of a context folder"),
    ("parse", "parse a file; alias of parse-file"),
    ("parse-file", "parse a file"),
    ("parse-all", "parse every file of a context folder"),
    ("typecheck", "typecheck a file; alias of typecheck-file"),
    ("typecheck-file", "typecheck a file"),
    ("typecheck-all", "typecheck every file of a context folder"),
    ("typecheck-theory", "typecheck the file declaring a theory"),
    ("show-tccs", "proof obligations of one theory"),
    ("typecheck-file-and-show-tccs", "typecheck a file and collect obligations per theory"),
    ("typecheck-prove", "typecheck a file, discharge obligations and collect them"),
    ("prove-formula", "open a prover session on a formula"),
    ("step-tcc", "open a prover session on a proof obligation"),
    ("proof-command", "send a command to a prover session"),
    ("close-session", "close a prover session"),
    ("names-info", "names used in a file and their declarations"),
    ("find-declaration", "declarations of a symbol"),
    ("list-declarations", "declarations of a theory"),
    ("runit", "evaluate a ground expression in a theory"),
    ("lisp", "send raw text to the parser engine"),
    ("clean", "remove derived files from a context folder"),
    ("reset", "restart the parser and typechecker engines"),
    ("clear-theories", "make the running engines forget loaded theories"),
    ("status", "engine handles and their states"),
];

/// Error member of a response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacadeError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FacadeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn code_for(kind: ErrorKind) -> i32 {
        match kind {
            ErrorKind::Protocol => codes::INVALID_REQUEST,
            ErrorKind::EngineReported => codes::ENGINE_REPORTED,
            ErrorKind::ProcessFault => codes::PROCESS_FAULT,
            ErrorKind::Coordination => codes::COORDINATION,
        }
    }
}

impl From<&EngineError> for FacadeError {
    fn from(err: &EngineError) -> Self {
        let failure = EngineFailure::from(err);
        let code = Self::code_for(failure.kind);
        match failure.kind {
            ErrorKind::ProcessFault => FacadeError::new(code, "system failure").with_data(json!({
                "detail": failure.message,
                "recommendation": "clean the workspace cache (pvsbin, .pvscontext) and retry",
            })),
            _ => {
                let data = serde_json::to_value(&failure).ok();
                FacadeError {
                    code,
                    message: failure.message,
                    data,
                }
            }
        }
    }
}

/// `{ result?, error? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacadeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FacadeError>,
}

impl FacadeResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: FacadeError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

type Outcome = std::result::Result<Value, FacadeError>;

fn to_value<T: Serialize>(value: T) -> Outcome {
    serde_json::to_value(value)
        .map_err(|e| FacadeError::new(codes::INVALID_REQUEST, format!("unserializable result: {e}")))
}

fn engine<T: Serialize>(result: crate::error::Result<T>) -> Outcome {
    match result {
        Ok(value) => to_value(value),
        Err(err) => Err(FacadeError::from(&err)),
    }
}

/// A proof state with the session id beside its own fields
fn proof_result(result: crate::error::Result<ProofSession>) -> Outcome {
    let session = result.map_err(|e| FacadeError::from(&e))?;
    let mut value = to_value(&session.proof_state)?;
    if let Value::Object(map) = &mut value {
        map.insert("session".to_string(), json!(session.session));
    }
    Ok(value)
}

/// Params come as an object, a one-element array or a bare string
fn unwrap_params(params: Value) -> Value {
    match params {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    }
}

fn decode<T: DeserializeOwned>(params: &Value) -> std::result::Result<T, FacadeError> {
    serde_json::from_value(params.clone()).map_err(|e| FacadeError::invalid_params(e.to_string()))
}

/// A string field, or the params themselves when they are a string
fn string_param(params: &Value, keys: &[&str]) -> std::result::Result<String, FacadeError> {
    if let Value::String(s) = params {
        return Ok(s.clone());
    }
    keys.iter()
        .find_map(|key| params.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| FacadeError::invalid_params(format!("missing parameter {}", keys[0])))
}

fn optional_string(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn session_param(params: &Value) -> Option<u64> {
    params.get("session").and_then(Value::as_u64)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanParams {
    context_folder: String,
    #[serde(default)]
    keep_tccs: Option<bool>,
    #[serde(default)]
    recursive: bool,
}

/// Entry point for every transport
pub struct PvsFacade {
    coordinator: Arc<WorkspaceCoordinator>,
    keep_tccs_on_clean: bool,
}

impl PvsFacade {
    pub fn new(coordinator: Arc<WorkspaceCoordinator>) -> Self {
        Self {
            coordinator,
            keep_tccs_on_clean: false,
        }
    }

    /// Default for `clean` when the request does not say
    pub fn keep_tccs_on_clean(mut self, keep: bool) -> Self {
        self.keep_tccs_on_clean = keep;
        self
    }

    pub fn coordinator(&self) -> &Arc<WorkspaceCoordinator> {
        &self.coordinator
    }

    pub fn method_names() -> Vec<&'static str> {
        METHODS.iter().map(|(name, _)| *name).collect()
    }

    pub async fn mode(&self) -> EngineMode {
        self.coordinator.mode().await
    }

    pub async fn context(&self) -> Option<String> {
        self.coordinator.tracked_context().await
    }

    pub async fn handle(&self, method: &str, params: Value) -> FacadeResponse {
        debug!(method, "Facade request");
        match self.dispatch(method, unwrap_params(params)).await {
            Ok(result) => FacadeResponse::ok(result),
            Err(error) => {
                if error.code == codes::PROCESS_FAULT {
                    warn!(method, data = ?error.data, "System failure");
                } else {
                    debug!(method, code = error.code, message = %error.message, "Request failed");
                }
                FacadeResponse::err(error)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Outcome {
        let c = &self.coordinator;
        match method {
            "list-methods" => to_value(Self::method_names()),
            "list-client-methods" => Ok(json!([])),
            "help" => Ok(self.help(optional_string(&params, "method").or_else(|| params.as_str().map(str::to_string)))),
            "version" => engine(c.version().await),
            "change-context" => {
                let folder = string_param(&params, &["contextFolder", "context"])?;
                engine(c.change_context(&folder).await)
            }
            "current-context" => engine(c.current_context().await),
            "list-files" => {
                let folder = string_param(&params, &["contextFolder"])?;
                engine(c.list_files(&folder).await)
            }
            "list-theories" => engine(c.list_theories(&decode(&params)?).await),
            "list-all-theories" => {
                let folder = string_param(&params, &["contextFolder"])?;
                engine(c.list_all_theories(&folder).await)
            }
            "parse" | "parse-file" => engine(c.parse_file(&decode(&params)?).await),
            "parse-all" => {
                let folder = string_param(&params, &["contextFolder"])?;
                engine(c.parse_all(&folder).await)
            }
            "typecheck" | "typecheck-file" => engine(c.typecheck_file(&decode(&params)?).await),
            "typecheck-all" => {
                let folder = string_param(&params, &["contextFolder"])?;
                engine(c.typecheck_all(&folder).await)
            }
            "typecheck-theory" => {
                let folder = string_param(&params, &["contextFolder"])?;
                let theory = params
                    .get("theoryName")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FacadeError::invalid_params("missing parameter theoryName"))?;
                engine(c.typecheck_theory(&folder, theory).await)
            }
            "show-tccs" => engine(c.show_tccs(&decode(&params)?).await),
            "typecheck-file-and-show-tccs" => {
                engine(c.typecheck_file_and_show_tccs(&decode(&params)?).await)
            }
            "typecheck-prove" => engine(c.typecheck_prove(&decode(&params)?).await),
            "prove-formula" => proof_result(c.step_proof(&decode(&params)?).await),
            "step-tcc" => proof_result(c.step_tcc(&decode(&params)?).await),
            "proof-command" => {
                let command = string_param(&params, &["cmd", "command"])?;
                proof_result(c.proof_command(session_param(&params), &command).await)
            }
            "close-session" => {
                let session = session_param(&params)
                    .ok_or_else(|| FacadeError::invalid_params("missing parameter session"))?;
                engine(c.close_session(session).await)
            }
            "names-info" => engine(c.names_info(&decode(&params)?).await),
            "find-declaration" => {
                let symbol = string_param(&params, &["symbolName", "symbol"])?;
                let folder = optional_string(&params, "contextFolder");
                engine(c.find_declaration(folder.as_deref(), &symbol).await)
            }
            "list-declarations" => engine(c.list_declarations(&decode(&params)?).await),
            "runit" => {
                let request: PvsRequest = decode(&params)?;
                let expression = string_param(&params, &["expr", "expression"])?;
                engine(c.runit(&request, &expression).await)
            }
            "lisp" => {
                let text = string_param(&params, &["cmd", "command"])?;
                engine(c.lisp(&text).await)
            }
            "clean" => {
                let clean: CleanParams = match &params {
                    Value::String(folder) => CleanParams {
                        context_folder: folder.clone(),
                        keep_tccs: None,
                        recursive: false,
                    },
                    other => decode(other)?,
                };
                let keep = clean.keep_tccs.unwrap_or(self.keep_tccs_on_clean);
                engine(c.clean(&clean.context_folder, keep, clean.recursive).await)
            }
            "reset" => engine(c.reset().await),
            "clear-theories" => engine(c.clear_theories().await),
            "status" => to_value(c.handles().await),
            other => Err(FacadeError::method_not_found(other)),
        }
    }

    fn help(&self, method: Option<String>) -> Value {
        let mut entries = serde_json::Map::new();
        match method {
            Some(name) => {
                let text = METHODS
                    .iter()
                    .find(|(m, _)| *m == name)
                    .map(|(_, text)| *text)
                    .unwrap_or("unknown method");
                entries.insert(name, json!(text));
            }
            None => {
                for (m, text) in METHODS {
                    entries.insert(m.to_string(), json!(text));
                }
            }
        }
        Value::Object(entries)
    }

    /// Kill every engine
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}
