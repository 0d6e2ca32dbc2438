// One-shot facade request

use async_trait::async_trait;
use pvsbridge_engine::EngineConfig;
use serde_json::Value;

use super::{build_facade, Command};
use crate::error::{CliError, CliResult};

pub struct RequestCommand {
    config: EngineConfig,
    method: String,
    params: Option<String>,
}

impl RequestCommand {
    pub fn new(config: EngineConfig, method: String, params: Option<String>) -> Self {
        Self {
            config,
            method,
            params,
        }
    }

    /// Bare words are taken as a single string parameter
    pub fn parse_params(raw: Option<&str>) -> CliResult<Value> {
        match raw {
            None => Ok(Value::Null),
            Some(text) => match serde_json::from_str(text) {
                Ok(value) => Ok(value),
                Err(_) if !text.trim_start().starts_with(['[', '{']) => {
                    Ok(Value::String(text.to_string()))
                }
                Err(e) => Err(CliError::InvalidArgument {
                    message: format!("params are not valid JSON: {e}"),
                }),
            },
        }
    }
}

#[async_trait]
impl Command for RequestCommand {
    async fn execute(&self) -> CliResult<()> {
        let params = Self::parse_params(self.params.as_deref())?;
        let facade = build_facade(&self.config);
        let envelope = facade.handle(&self.method, params).await;
        facade.shutdown().await;

        let text = serde_json::to_string_pretty(&envelope)
            .map_err(|e| CliError::Server(e.to_string()))?;
        println!("{text}");
        if envelope.is_error() {
            return Err(CliError::Server(format!("{} failed", self.method)));
        }
        Ok(())
    }
}
