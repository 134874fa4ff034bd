use tracing_subscriber::EnvFilter;

/// Filter directive: `RUST_LOG` wins, then `--verbose`, then the config.
pub fn filter_directive(env: Option<&str>, verbose: bool, configured: &str) -> String {
    match env {
        Some(env) if !env.trim().is_empty() => env.to_string(),
        _ if verbose => "debug".to_string(),
        _ => configured.to_string(),
    }
}

/// Installs the global subscriber. Logs go to stderr so command output on
/// stdout stays clean.
pub fn init(verbose: bool, configured: &str) {
    let env = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(env.as_deref(), verbose, configured);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
