//! Failures raised while launching or tearing down an engine process

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to start the child
    #[error("could not start engine process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Neither the given path nor a `PATH` lookup produced a binary
    #[error("engine executable `{0}` not found")]
    ExecutableNotFound(String),

    #[error("engine process did not exit within {seconds}s")]
    Timeout { seconds: u64 },

    /// stdin/stdout were already handed out, or never piped
    #[error("engine {stream} pipe is not available")]
    StdioUnavailable { stream: &'static str },

    #[error("could not terminate engine process: {0}")]
    KillFailed(String),

    #[error("invalid engine launch settings: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
