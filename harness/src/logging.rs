//! Development-time tracing for the harness.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`. They are not
//! part of the run's product output: the JSON run report is written
//! regardless of the log filter. Command lines and env values are never
//! logged; spans carry the program name only.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=harness=debug harness run blueprints/demo.toml
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
