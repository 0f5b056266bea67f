//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over `application.log_level` so a single run can
//! be made more verbose without touching the settings file.

use crate::config::{LogFormat, Settings};
use tracing_subscriber::EnvFilter;

/// Builds the filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(settings: &Settings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.application.log_level.to_lowercase()))
}

/// Installs the global subscriber. Returns `false` if one was already set.
pub fn init(settings: &Settings) -> bool {
    let filter = env_filter(settings);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match settings.application.log_format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}
