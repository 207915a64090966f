//! Tracing initialisation for the harness binary and its tests

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber for the `consul-e2e` binary.
///
/// Honours `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Install a subscriber for tests. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}
