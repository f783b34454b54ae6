//! `tracing` setup for binaries built on this crate.

use tracing_subscriber::EnvFilter;

/// Variable holding a `tracing` filter directive, e.g. `studio_cache=debug`.
pub const LOG_ENV: &str = "STUDIO_LOG";

/// Installs a global fmt subscriber.
///
/// The filter comes from [`LOG_ENV`] if set and valid, otherwise from
/// `default_filter`. Fails if a global subscriber is already installed.
pub fn init(default_filter: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter))
}
