// pvsbridge command-line front end

pub mod commands;
pub mod error;
pub mod logging;
pub mod router;

pub use error::{CliError, CliResult};
pub use logging::init_logging;
pub use router::{Cli, CommandRouter, Commands};
