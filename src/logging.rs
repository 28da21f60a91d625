use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the process-wide tracing subscriber. Idempotent: safe to call
/// from both `main` and from test harnesses that spin up daemon instances
/// in-process.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .ok();
        tracing::info!(event = "logging_initialized");
    });
}
