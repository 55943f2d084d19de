//! Tracing setup for the CLI.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins when set; otherwise
/// `--verbose` selects debug-level output for this crate, warn for the rest.
pub fn set_verbose(verbose: bool) {
    let default_directive = if verbose {
        "warn,dispatchq=debug"
    } else {
        "warn,dispatchq=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // Logs go to stderr; stdout is reserved for JSON results.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
