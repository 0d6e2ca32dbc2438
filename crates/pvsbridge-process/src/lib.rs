//! # pvsbridge-process
//!
//! OS-level plumbing for engine processes: resolving and spawning the engine
//! binary with piped stdio in its own process group, and tearing the whole
//! process tree down again.
//!
//! ```rust,no_run
//! use pvsbridge_process::{ProcessConfig, ProcessManager};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ProcessManager::new();
//! let config = ProcessConfig::new("/opt/pvs/pvs").args(["-raw"]);
//!
//! let mut child = manager.spawn(config).await?;
//! let stdio = child.take_stdio()?;
//! drop(stdio);
//! child.kill().await?;
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod manager;

pub use child::{ChildStdio, ManagedChild};
pub use config::ProcessConfig;
pub use error::{ProcessError, Result};
pub use manager::ProcessManager;
