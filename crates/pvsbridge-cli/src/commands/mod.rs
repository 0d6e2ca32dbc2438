// Command handlers for the pvsbridge binary

pub mod clean;
pub mod request;
pub mod serve;
pub mod xmlrpc;

pub use clean::CleanCommand;
pub use request::RequestCommand;
pub use serve::ServeCommand;
pub use xmlrpc::{xmlrpc_router, XmlRpcCommand};

use std::sync::Arc;

use async_trait::async_trait;
use pvsbridge_engine::{EngineConfig, PvsFacade, WorkspaceCoordinator};

use crate::error::CliResult;

/// Trait for command handlers
#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(&self) -> CliResult<()>;
}

/// Facade over real engine processes described by `config`
pub fn build_facade(config: &EngineConfig) -> Arc<PvsFacade> {
    let coordinator = Arc::new(WorkspaceCoordinator::from_config(config));
    Arc::new(PvsFacade::new(coordinator).keep_tccs_on_clean(config.keep_tccs_on_clean))
}
