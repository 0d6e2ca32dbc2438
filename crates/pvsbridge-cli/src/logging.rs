//! Log output goes to stderr; stdout carries the JSON-RPC stream

use tracing::Level;

pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber; a second call is a no-op
pub fn init_logging(level: &str) {
    let level = parse_level(level);
    let verbose = level >= Level::DEBUG;
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(verbose)
        .with_thread_ids(verbose)
        .with_line_number(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}
