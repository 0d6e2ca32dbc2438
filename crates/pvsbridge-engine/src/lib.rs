//! # pvsbridge-engine
//!
//! Drives PVS engine processes over their interactive stdio: frames replies
//! on prompts, parses them into structured results, serializes commands per
//! process, and coordinates contexts and artifacts across a pool of handles.
//!
//! The [`PvsFacade`] exposes all of it as named JSON methods, served either
//! over stdio JSON-RPC ([`rpc::serve`]) or XML-RPC ([`xmlrpc::handle_xmlrpc`]).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pvsbridge_engine::{EngineConfig, PvsFacade, WorkspaceCoordinator};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load(None)?;
//! let coordinator = Arc::new(WorkspaceCoordinator::from_config(&config));
//! let facade = PvsFacade::new(coordinator);
//!
//! let reply = facade
//!     .handle("change-context", serde_json::json!(["/home/me/theories"]))
//!     .await;
//! println!("{:?}", reply);
//! facade.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod facade;
pub mod framing;
pub mod handle;
pub mod manager;
pub mod parser;
pub mod queue;
pub mod reader;
pub mod rpc;
pub mod sexpr;
pub mod transport;
pub mod types;
pub mod workspace;
pub mod xmlrpc;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use command::{CommandFamily, EngineCommand};
pub use config::{EngineConfig, XmlRpcConfig};
pub use coordinator::{EngineMode, FileOutcome, ProofSession, WorkspaceCoordinator};
pub use error::{EngineError, ErrorKind, Result};
pub use facade::{FacadeError, FacadeResponse, PvsFacade};
pub use framing::{FrameStatus, PromptFraming, ReplyFraming};
pub use handle::{ContextSession, EngineHandle, EngineRole, HandleSettings, HandleState};
pub use manager::{EngineManager, HandleSummary};
pub use parser::ReplyParser;
pub use queue::CommandQueue;
pub use reader::{Frame, ReplyReader};
pub use rpc::{JsonRpcRequest, JsonRpcResponse};
pub use transport::{EngineIo, EngineLauncher, ProcessLauncher};
pub use types::{EngineFailure, EnginePayload, EngineResponse, ProofState, PvsRequest, TccMap};
pub use workspace::ArtifactStore;
