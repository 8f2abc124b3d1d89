//! Logging setup for applications embedding the solver
//!
//! The library itself only emits `tracing` events: per-iteration solver progress at
//! DEBUG, driver summaries at INFO and degraded paths at WARN. These helpers install a
//! `tracing-subscriber` formatter for hosts and tests that want to see them.

use tracing::Level;

/// Initialize the tracing subscriber with the default INFO level
///
/// The level can be overridden with the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use fusion_solver::init_logger;
///
/// init_logger();
/// tracing::info!("mapping thread started");
/// ```
///
/// # Environment Variables
/// ```bash
/// RUST_LOG=fusion_solver::optimizer=debug cargo test
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// Calling it a second time is a no-op, so test binaries may call it from every test.
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
///
/// # Example
/// ```no_run
/// use fusion_solver::init_logger_with_level;
/// use tracing::Level;
///
/// init_logger_with_level(Level::DEBUG);
/// tracing::debug!("solver iterations will be printed");
/// ```
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .try_init();
}
