// Command routing and dispatch

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pvsbridge_engine::EngineConfig;

use crate::commands::{CleanCommand, Command, RequestCommand, ServeCommand, XmlRpcCommand};
use crate::error::{CliError, CliResult};

/// pvsbridge - drive PVS engine processes from an editor
#[derive(Parser, Debug)]
#[command(name = "pvsbridge")]
#[command(about = "Serialized, crash-aware front end for PVS engine processes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve Content-Length framed JSON-RPC on stdin/stdout
    Serve,

    /// Serve the XML-RPC endpoint over HTTP
    Xmlrpc {
        /// Listen address (default from config)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (default from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one facade method and print its envelope as JSON
    Request {
        /// Method name, e.g. typecheck
        #[arg(value_name = "METHOD")]
        method: String,

        /// Parameters as JSON
        #[arg(value_name = "PARAMS")]
        params: Option<String>,
    },

    /// Remove derived files from a context folder
    Clean {
        #[arg(value_name = "FOLDER")]
        folder: String,

        /// Keep .tccs files
        #[arg(long)]
        keep_tccs: bool,

        /// Also clean immediate subfolders
        #[arg(long)]
        recursive: bool,
    },
}

pub struct CommandRouter;

impl CommandRouter {
    /// Parse arguments, load configuration, set up logging and run
    pub async fn route() -> CliResult<()> {
        let cli = Cli::parse();
        let config = Self::load_config(&cli)?;
        crate::logging::init_logging(&config.log_level);
        Self::execute(&cli, config).await
    }

    pub fn load_config(cli: &Cli) -> CliResult<EngineConfig> {
        let mut config =
            EngineConfig::load(cli.config.as_deref()).map_err(|e| CliError::Config(e.to_string()))?;
        if let Some(level) = &cli.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }

    pub async fn execute(cli: &Cli, config: EngineConfig) -> CliResult<()> {
        match &cli.command {
            Commands::Serve => ServeCommand::new(config).execute().await,
            Commands::Xmlrpc { host, port } => {
                XmlRpcCommand::new(config)
                    .with_host(host.clone())
                    .with_port(*port)
                    .execute()
                    .await
            }
            Commands::Request { method, params } => {
                RequestCommand::new(config, method.clone(), params.clone())
                    .execute()
                    .await
            }
            Commands::Clean {
                folder,
                keep_tccs,
                recursive,
            } => {
                CleanCommand::new(config, folder.clone())
                    .with_keep_tccs(*keep_tccs)
                    .with_recursive(*recursive)
                    .execute()
                    .await
            }
        }
    }
}
