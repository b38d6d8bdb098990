//! Ambient `tracing` setup for the binary.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` subscriber, honoring `RUST_LOG` and
/// defaulting to `info` when it's unset.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
