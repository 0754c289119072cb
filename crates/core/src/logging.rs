//! Structured logging infrastructure for Lifeline.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use lifeline_core::logging;
///
/// logging::init();
/// tracing::info!("Node started");
/// ```
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Initialize human-readable logging with an explicit fallback filter
/// (used when the node config carries a `log_level`).
pub fn init_with_filter(fallback: &str) {
    // A second init in the same process (tests, embedding hosts) is not an error.
    let _ = tracing_subscriber::registry()
        .with(env_filter(fallback))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}

/// Initialize the logging system with JSON output for field deployments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
/// Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use lifeline_core::logging;
///
/// logging::init_json();
/// tracing::info!(component = "pool", "Pool manager started");
/// ```
pub fn init_json() {
    init_json_with_filter(DEFAULT_FILTER);
}

/// JSON logging with an explicit fallback filter
pub fn init_json_with_filter(fallback: &str) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(fallback))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init();
}
