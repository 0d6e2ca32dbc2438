use pvsbridge_engine::EngineError;
use thiserror::Error;

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Server error: {0}")]
    Server(String),
}

impl CliError {
    /// Message printed before exiting with status 1
    pub fn user_message(&self) -> String {
        match self {
            CliError::InvalidArgument { message } => {
                format!("Invalid argument: {}\n\nRun 'pvsbridge --help' for usage information.", message)
            }
            CliError::Config(msg) => {
                format!("Configuration error: {}\n\nCheck {} or the PVSBRIDGE_* environment.", msg, pvsbridge_engine::EngineConfig::default_path().display())
            }
            other => other.to_string(),
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
