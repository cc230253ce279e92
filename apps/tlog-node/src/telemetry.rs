//! Log subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the console subscriber. `RUST_LOG` overrides `level`.
///
/// Call this once at startup, before any `tracing` events are emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
