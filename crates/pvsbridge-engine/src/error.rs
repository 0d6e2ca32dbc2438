//! Error types for the engine layer

use pvsbridge_process::ProcessError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EngineFailure;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse classification used by callers to decide how to surface a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed or unrecognized command; never retried
    Protocol,
    /// The engine ran the command and reported a domain failure
    EngineReported,
    /// The engine process is unusable; the handle must be replaced
    ProcessFault,
    /// The request does not resolve to a consistent context
    Coordination,
}

/// Errors raised while talking to an engine process
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unrecognized command: {0}")]
    UnrecognizedCommand(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Engine busy, cannot execute {command}")]
    Busy { command: String },

    #[error("Engine crashed: {0}")]
    Crashed(String),

    #[error("Command {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("Engine handle {id} is {state}")]
    HandleUnavailable { id: u64, state: String },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Coordination error: {0}")]
    Coordination(String),

    /// A failure carried in a reply, lifted into an error by the coordinator
    #[error("{}", .0.message)]
    Reported(Box<EngineFailure>),

    #[error("Command cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Reported(failure) => failure.kind,
            EngineError::UnrecognizedCommand(_) | EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Busy { .. }
            | EngineError::Crashed(_)
            | EngineError::Timeout { .. }
            | EngineError::HandleUnavailable { .. }
            | EngineError::Process(_)
            | EngineError::Io(_) => ErrorKind::ProcessFault,
            EngineError::Coordination(_)
            | EngineError::Cancelled(_)
            | EngineError::Config(_)
            | EngineError::Serialization(_) => ErrorKind::Coordination,
        }
    }

    pub fn reported(failure: EngineFailure) -> Self {
        EngineError::Reported(Box::new(failure))
    }

    /// Whether the handle that produced this error must be discarded
    pub fn is_process_fault(&self) -> bool {
        self.kind() == ErrorKind::ProcessFault
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            EngineError::UnrecognizedCommand("(frobnicate)".into()).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            EngineError::Busy { command: "(parse-file \"a\" nil nil)".into() }.kind(),
            ErrorKind::ProcessFault
        );
        assert_eq!(
            EngineError::Timeout { command: "x".into(), seconds: 3 }.kind(),
            ErrorKind::ProcessFault
        );
        assert_eq!(
            EngineError::Coordination("missing theory".into()).kind(),
            ErrorKind::Coordination
        );
        assert!(EngineError::Crashed("eof".into()).is_process_fault());
    }

    #[test]
    fn test_busy_message_names_command() {
        let err = EngineError::Busy { command: "(show-tccs \"t\" nil)".into() };
        assert_eq!(err.to_string(), "Engine busy, cannot execute (show-tccs \"t\" nil)");
    }
}
