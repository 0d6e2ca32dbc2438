//! JSON-RPC 2.0 over `Content-Length` framed streams

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::facade::{codes, FacadeError, FacadeResponse, PvsFacade};

pub type JsonRpcError = FacadeError;

/// Largest message body accepted from a client
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Request or notification; notifications have no id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Wrap a facade envelope; a missing result becomes `null`
    pub fn from_envelope(id: Value, envelope: FacadeResponse) -> Self {
        match envelope.error {
            Some(error) => Self::error(id, error),
            None => Self::success(id, envelope.result.unwrap_or(Value::Null)),
        }
    }
}

/// Reads `Content-Length` framed messages
pub struct MessageReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Next message body; `None` at end of stream
    pub async fn read_message(&mut self) -> Result<Option<String>> {
        let mut headers = HashMap::new();
        let mut saw_header = false;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                if saw_header {
                    return Err(EngineError::Protocol(
                        "stream closed inside message headers".to_string(),
                    ));
                }
                return Ok(None);
            }
            let line = line.trim();
            if line.is_empty() {
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let length: usize = headers
            .get("content-length")
            .ok_or_else(|| EngineError::Protocol("missing Content-Length header".to_string()))?
            .parse()
            .map_err(|e| EngineError::Protocol(format!("invalid Content-Length: {e}")))?;
        if length > MAX_MESSAGE_BYTES {
            return Err(EngineError::Protocol(format!(
                "message of {length} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit"
            )));
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        String::from_utf8(body)
            .map(Some)
            .map_err(|e| EngineError::Protocol(format!("message is not UTF-8: {e}")))
    }
}

/// Writes `Content-Length` framed messages
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message(&mut self, body: &str) -> Result<()> {
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        self.writer.write_all(framed.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_response(&mut self, response: &JsonRpcResponse) -> Result<()> {
        self.write_message(&serde_json::to_string(response)?).await
    }
}

/// Serve facade requests until end of stream, `exit`, or the `shutdown` token.
///
/// Requests run concurrently and responses are written as they complete.
/// Every engine is killed before this returns.
pub async fn serve<R, W>(
    facade: Arc<PvsFacade>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = MessageReader::new(reader);
    let mut writer = MessageWriter::new(writer);
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    info!("JSON-RPC server started");

    let read_loop = async {
        let tx = tx;
        let mut shutting_down = false;
        let outcome = loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                message = reader.read_message() => message,
            };
            let body = match message {
                Ok(Some(body)) => body,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            let request: JsonRpcRequest = match serde_json::from_str(&body) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Malformed JSON-RPC message");
                    let error = FacadeError::new(codes::PARSE_ERROR, format!("parse error: {e}"));
                    let _ = tx.send(JsonRpcResponse::error(Value::Null, error));
                    continue;
                }
            };
            debug!(method = %request.method, id = ?request.id, "JSON-RPC request");

            match request.method.as_str() {
                "exit" => break Ok(()),
                "shutdown" => {
                    shutting_down = true;
                    if let Some(id) = request.id {
                        let _ = tx.send(JsonRpcResponse::success(id, Value::Null));
                    }
                    continue;
                }
                _ if shutting_down => {
                    if let Some(id) = request.id {
                        let error = FacadeError::new(codes::INVALID_REQUEST, "server is shutting down");
                        let _ = tx.send(JsonRpcResponse::error(id, error));
                    }
                    continue;
                }
                _ => {}
            }

            let facade = facade.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let envelope = facade
                    .handle(&request.method, request.params.unwrap_or(Value::Null))
                    .await;
                if let Some(id) = request.id {
                    let _ = tx.send(JsonRpcResponse::from_envelope(id, envelope));
                }
            });
        };
        // In-flight requests fail fast once their engines are gone
        facade.shutdown().await;
        outcome
    };

    let write_loop = async {
        while let Some(response) = rx.recv().await {
            writer.write_response(&response).await?;
        }
        Ok::<(), EngineError>(())
    };

    let (read_outcome, write_outcome) = tokio::join!(read_loop, write_loop);
    info!("JSON-RPC server stopped");
    read_outcome.and(write_outcome)
}
