//! Logging bootstrap.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! application's choice.  [`init_logging`] is the one-liner for applications
//! (and tests) that just want formatted output on stderr.

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`, or by `level` when
/// `RUST_LOG` is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .try_init()
        .is_ok()
}
