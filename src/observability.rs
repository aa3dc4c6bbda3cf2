//! Observability utilities.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

/// Install the global tracing subscriber from the runtime configuration.
///
/// The filter comes from `RUST_LOG` when set and from the configured
/// `log_level` otherwise; `json_logs` switches the line format. Returns
/// false when a subscriber is already installed — re-initialization is a
/// no-op, not an error, so embedding servers may call this unconditionally.
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logs {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            eprintln!("tracing init skipped: {err}");
            false
        }
    }
}
