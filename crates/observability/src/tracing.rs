//! Tracing/logging initialization.
//!
//! Production processes log JSON lines; tests log human-readable output
//! through the test harness's capture. Both honour `RUST_LOG`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Like [`init`] with an explicit default filter, e.g. `"txflow_infra=debug"`.
/// `RUST_LOG` still wins when set.
pub fn init_with_filter(default: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}

/// Compact output routed through the test writer, so it only shows for
/// failing tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("txflow_infra=debug"))
        .with_test_writer()
        .with_thread_names(true)
        .compact()
        .try_init();
}
