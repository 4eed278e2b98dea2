//! Tracing subscriber setup.

use crate::error::SpiderError;
use crate::settings::{Settings, LOG_LEVEL};
use tracing_subscriber::EnvFilter;

/// Builds the filter from `RUST_LOG`, falling back to the `LOG_LEVEL` setting.
pub fn env_filter(settings: &Settings) -> Result<EnvFilter, SpiderError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = match settings.get(LOG_LEVEL) {
        Some(serde_json::Value::String(level)) => level.clone(),
        Some(other) => {
            return Err(SpiderError::Configuration(format!(
                "LOG_LEVEL must be a string, got {}",
                other
            )))
        }
        None => "info".to_string(),
    };
    EnvFilter::try_new(&level)
        .map_err(|e| SpiderError::Configuration(format!("invalid LOG_LEVEL {:?}: {}", level, e)))
}

/// Installs a global `fmt` subscriber. Returns `false` if one was already set.
pub fn init_tracing(settings: &Settings) -> Result<bool, SpiderError> {
    let filter = env_filter(settings)?;
    Ok(tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok())
}
