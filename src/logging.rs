//! Tracing bootstrap for hosts that don't install their own subscriber.

use std::env;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "OUTBOX_LOG";
const DEFAULT_FILTER: &str = "info,outbox_core=debug";

/// Install a global fmt subscriber.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `OUTBOX_LOG`
/// 3) internal default filter
///
/// Calling this again, or after the host installed a subscriber, does
/// nothing.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(fallback_directives(env::var(LOG_ENV_VAR).ok()))
}

fn fallback_directives(app_value: Option<String>) -> String {
    app_value
        .filter(|v| !v.trim().is_empty())
        .filter(|v| EnvFilter::try_new(v).is_ok())
        .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
}
