//! Tracing bootstrap for the smoke driver.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,chat_smoke=debug,chat_runtime=debug";

/// Install the global subscriber. Safe to call more than once.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `TASKCHAT_SMOKE_LOG`
/// 3) `TASKCHAT_LOG`
/// 4) built-in default
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter_from_lookup(|key| env::var(key).ok()))
        .try_init();
}

fn filter_from_lookup<F>(lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("RUST_LOG")
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return filter;
    }

    for key in ["TASKCHAT_SMOKE_LOG", "TASKCHAT_LOG"] {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
