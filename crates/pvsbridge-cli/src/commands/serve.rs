// stdio JSON-RPC server

use async_trait::async_trait;
use pvsbridge_engine::{rpc, EngineConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{build_facade, Command};
use crate::error::CliResult;

pub struct ServeCommand {
    config: EngineConfig,
}

impl ServeCommand {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> CliResult<()> {
        let facade = build_facade(&self.config);
        let shutdown = CancellationToken::new();

        let interrupt = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down");
                interrupt.cancel();
            }
        });

        info!(pvs_path = %self.config.pvs_path.display(), "Serving JSON-RPC on stdio");
        let result = rpc::serve(facade, tokio::io::stdin(), tokio::io::stdout(), shutdown.clone()).await;
        shutdown.cancel();
        result?;
        info!("JSON-RPC server stopped");
        Ok(())
    }
}
