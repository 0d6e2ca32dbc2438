//! Engine configuration
//!
//! Loaded from an optional TOML file and then `PVSBRIDGE_*` environment
//! variables, nested keys separated by `__` (`PVSBRIDGE_XMLRPC__SERVER_PORT`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const ENV_PREFIX: &str = "PVSBRIDGE";

/// XML-RPC binding settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmlRpcConfig {
    pub host: String,
    pub server_port: u16,
    /// Port of the front-end's callback server
    pub client_port: u16,
    pub path: String,
}

impl Default for XmlRpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            server_port: 22334,
            client_port: 9092,
            path: "/RPC2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine installation directory; empty means look the binary up on PATH
    pub pvs_path: PathBuf,
    pub engine_binary: String,
    pub engine_args: Vec<String>,
    pub startup_timeout_secs: u64,
    /// 0 disables the per-command timeout
    pub command_timeout_secs: u64,
    /// Verbose error reporting for parser and typechecker engines
    pub emacs_interface: bool,
    pub keep_tccs_on_clean: bool,
    /// Typechecker engines run at once by `typecheck_all`
    pub max_parallel: usize,
    pub log_level: String,
    pub xmlrpc: XmlRpcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pvs_path: PathBuf::new(),
            engine_binary: "pvs".to_string(),
            engine_args: vec!["-raw".to_string()],
            startup_timeout_secs: 60,
            command_timeout_secs: 300,
            emacs_interface: true,
            keep_tccs_on_clean: false,
            max_parallel: 4,
            log_level: "info".to_string(),
            xmlrpc: XmlRpcConfig::default(),
        }
    }
}

impl EngineConfig {
    /// `~/.config/pvsbridge/config.toml` or the platform equivalent
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pvsbridge")
            .join("config.toml")
    }

    /// Load from `path` (or the default path) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let loaded: EngineConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine_binary.trim().is_empty() {
            return Err(EngineError::Config(
                "engine_binary must not be empty".to_string(),
            ));
        }
        if self.startup_timeout_secs == 0 {
            return Err(EngineError::Config(
                "startup_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_parallel == 0 {
            return Err(EngineError::Config(
                "max_parallel must be greater than 0".to_string(),
            ));
        }
        if self.xmlrpc.server_port == 0 || self.xmlrpc.client_port == 0 {
            return Err(EngineError::Config(
                "xmlrpc ports must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Path or bare name of the engine executable
    pub fn engine_program(&self) -> PathBuf {
        if self.pvs_path.as_os_str().is_empty() {
            PathBuf::from(&self.engine_binary)
        } else {
            self.pvs_path.join(&self.engine_binary)
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}
