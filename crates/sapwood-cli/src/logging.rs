use tracing_subscriber::EnvFilter;

/// Initialize structured logging with tracing-subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to the provided
/// level. Logs go to stderr; stdout carries command output.
pub fn init(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Level from the output flags: quiet wins over verbose.
pub fn level(verbose: bool, quiet: bool, configured: &str) -> &str {
    if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        configured
    }
}
