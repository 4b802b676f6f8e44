//! # Logging Setup
//!
//! The gateway logs through the `log` facade; this module wires up an
//! `env_logger` backend for binaries and tests. Library code never
//! initializes logging on its own.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the env_logger backend once.
///
/// Safe to call repeatedly; later calls are no-ops. Honors `RUST_LOG`.
pub fn init_logger() {
    INIT.call_once(|| {
        env_logger::Builder::from_default_env()
            .format_timestamp_millis()
            .init();
    });
}

/// Log an info message through the facade.
pub fn log_info(message: &str) {
    log::info!("{message}");
}
