//! Process-level tracing setup for codetap binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level() -> tracing::Level {
    match std::env::var("CODETAP_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize tracing output from `CODETAP_LOG`.
///
/// All output goes to stderr: stdout is reserved for the frame stream in
/// stdio relay mode and for command output otherwise. Safe to call more
/// than once; only the first call installs the subscriber.
pub fn init() {
    if INIT.get().is_some() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}
