//! # Logging Initialization
//!
//! Tracing subscriber setup for applications embedding the adapter. Safe to
//! call more than once; only the first call installs a subscriber.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceLock<()> = OnceLock::new();

/// Initialize logging with the `RUST_LOG` filter, falling back to the given
/// default directive.
pub fn init_logging(default_filter: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// JSON-formatted variant for structured log shipping.
pub fn init_json_logging(default_filter: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        let _ = fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init();
    });
}
