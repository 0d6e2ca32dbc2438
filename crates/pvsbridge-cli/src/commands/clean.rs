// Remove derived files without starting an engine

use std::path::Path;

use async_trait::async_trait;
use pvsbridge_engine::{workspace, EngineConfig};
use tracing::info;

use super::Command;
use crate::error::{CliError, CliResult};

pub struct CleanCommand {
    config: EngineConfig,
    folder: String,
    keep_tccs: Option<bool>,
    recursive: bool,
}

impl CleanCommand {
    pub fn new(config: EngineConfig, folder: String) -> Self {
        Self {
            config,
            folder,
            keep_tccs: None,
            recursive: false,
        }
    }

    /// `false` falls back to `keep_tccs_on_clean`
    pub fn with_keep_tccs(mut self, keep: bool) -> Self {
        self.keep_tccs = keep.then_some(true);
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }
}

#[async_trait]
impl Command for CleanCommand {
    async fn execute(&self) -> CliResult<()> {
        let folder = workspace::normalize_context_folder(&self.folder);
        let path = Path::new(&folder);
        if !path.is_dir() {
            return Err(CliError::InvalidArgument {
                message: format!("{} is not a directory", folder),
            });
        }
        let keep_tccs = self.keep_tccs.unwrap_or(self.config.keep_tccs_on_clean);
        let cleaned = workspace::clean_bin(path, keep_tccs, self.recursive).await?;
        info!(folder = %folder, cleaned, "Cleaned context");
        println!("cleaned {cleaned} folder(s) under {folder}");
        Ok(())
    }
}
