//! # Settings Module
//!
//! Layered, read-only configuration store.
//!
//! ## Overview
//!
//! Values live in up to four layers, each a `serde_json` object. A lookup
//! returns the value from the highest layer that defines the key, in the order
//! custom > spider > module > default. The store is assembled by
//! [`EngineBuilder`](crate::builder::EngineBuilder) and then shared as
//! `Arc<Settings>`; nothing mutates it afterwards.
//!
//! ## Typed accessors
//!
//! Values are coerced leniently so that settings coming from JSON files,
//! environment-style strings and code all read the same way:
//!
//! - `get_bool`: null is false, numbers and numeric strings are true when non-zero
//! - `get_int` / `get_float`: numbers, booleans and numeric strings
//! - `get_list`: arrays, or a comma separated string; null is empty
//! - `get_map`: objects, or a string holding a JSON object; null is empty
//!
//! The plain accessors fail with [`SettingsError::Missing`] for an absent key,
//! while the `_or` variants fall back to the given default.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CONCURRENT_REQUESTS: &str = "CONCURRENT_REQUESTS";
pub const CONCURRENT_REQUESTS_PER_DOMAIN: &str = "CONCURRENT_REQUESTS_PER_DOMAIN";
pub const DOWNLOAD_DELAY: &str = "DOWNLOAD_DELAY";
pub const RANDOMIZE_DOWNLOAD_DELAY: &str = "RANDOMIZE_DOWNLOAD_DELAY";
pub const DOWNLOAD_TIMEOUT: &str = "DOWNLOAD_TIMEOUT";
pub const DOWNLOAD_MAXSIZE: &str = "DOWNLOAD_MAXSIZE";
pub const DOWNLOAD_HANDLERS: &str = "DOWNLOAD_HANDLERS";
pub const PIPELINE: &str = "PIPELINE";
pub const PIPELINE_BASE: &str = "PIPELINE_BASE";
pub const DEFAULT_REQUEST_HEADERS: &str = "DEFAULT_REQUEST_HEADERS";
pub const USER_AGENT: &str = "USER_AGENT";
pub const DUPEFILTER_CAPACITY: &str = "DUPEFILTER_CAPACITY";
pub const RETRY_ENABLED: &str = "RETRY_ENABLED";
pub const RETRY_TIMES: &str = "RETRY_TIMES";
pub const RETRY_HTTP_CODES: &str = "RETRY_HTTP_CODES";
pub const RETRY_PRIORITY_ADJUST: &str = "RETRY_PRIORITY_ADJUST";
pub const REDIRECT_ENABLED: &str = "REDIRECT_ENABLED";
pub const REDIRECT_MAX_TIMES: &str = "REDIRECT_MAX_TIMES";
pub const HTTPCACHE_ENABLED: &str = "HTTPCACHE_ENABLED";
pub const HTTPCACHE_MAX_ENTRIES: &str = "HTTPCACHE_MAX_ENTRIES";
pub const HTTPCACHE_IGNORE_HTTP_CODES: &str = "HTTPCACHE_IGNORE_HTTP_CODES";
pub const SHUTDOWN_TIMEOUT: &str = "SHUTDOWN_TIMEOUT";
pub const LOG_LEVEL: &str = "LOG_LEVEL";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required setting `{0}`")]
    Missing(String),

    #[error("setting `{key}` should be {expected}, found {found}")]
    InvalidType {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Layer a value was set at. Later variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingsPriority {
    Default,
    Module,
    Spider,
    Custom,
}

#[derive(Debug, Clone)]
pub struct Settings {
    layers: BTreeMap<SettingsPriority, Map<String, Value>>,
}

impl Settings {
    /// Creates a store whose default layer holds the built-in defaults.
    pub fn new() -> Self {
        let mut settings = Self::empty();
        settings.set_layer(SettingsPriority::Default, default_settings());
        settings
    }

    /// Creates a store with no layers at all.
    pub fn empty() -> Self {
        Self {
            layers: BTreeMap::new(),
        }
    }

    /// Merges `values` into the layer at `priority`, replacing keys it already holds.
    pub fn set_layer(&mut self, priority: SettingsPriority, values: Map<String, Value>) {
        self.layers.entry(priority).or_default().extend(values);
    }

    pub fn set(&mut self, priority: SettingsPriority, key: impl Into<String>, value: impl Into<Value>) {
        self.layers
            .entry(priority)
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Reads a JSON object from `path` into the module layer.
    pub fn load_module_file(&mut self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let values: Map<String, Value> =
            serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded {} settings from {}", values.len(), path.display());
        self.set_layer(SettingsPriority::Module, values);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.layers.values().rev().find_map(|layer| layer.get(key))
    }

    /// Priority of the layer currently providing `key`.
    pub fn priority_of(&self, key: &str) -> Option<SettingsPriority> {
        self.layers
            .iter()
            .rev()
            .find(|(_, layer)| layer.contains_key(key))
            .map(|(priority, _)| *priority)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_required(&self, key: &str) -> Result<&Value, SettingsError> {
        self.get(key).ok_or_else(|| SettingsError::Missing(key.to_string()))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, SettingsError> {
        coerce_bool(key, self.get_required(key)?)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, SettingsError> {
        self.get(key).map_or(Ok(default), |v| coerce_bool(key, v))
    }

    pub fn get_int(&self, key: &str) -> Result<i64, SettingsError> {
        coerce_int(key, self.get_required(key)?)
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64, SettingsError> {
        self.get(key).map_or(Ok(default), |v| coerce_int(key, v))
    }

    pub fn get_float(&self, key: &str) -> Result<f64, SettingsError> {
        coerce_float(key, self.get_required(key)?)
    }

    pub fn get_float_or(&self, key: &str, default: f64) -> Result<f64, SettingsError> {
        self.get(key).map_or(Ok(default), |v| coerce_float(key, v))
    }

    pub fn get_list(&self, key: &str) -> Result<Vec<Value>, SettingsError> {
        coerce_list(key, self.get_required(key)?)
    }

    pub fn get_list_or(&self, key: &str, default: Vec<Value>) -> Result<Vec<Value>, SettingsError> {
        self.get(key).map_or(Ok(default), |v| coerce_list(key, v))
    }

    pub fn get_map(&self, key: &str) -> Result<Map<String, Value>, SettingsError> {
        coerce_map(key, self.get_required(key)?)
    }

    pub fn get_map_or(&self, key: &str, default: Map<String, Value>) -> Result<Map<String, Value>, SettingsError> {
        self.get(key).map_or(Ok(default), |v| coerce_map(key, v))
    }

    /// Reads a list of HTTP status codes.
    pub fn get_status_codes(&self, key: &str) -> Result<Vec<u16>, SettingsError> {
        self.get_list_or(key, Vec::new())?
            .iter()
            .map(|v| {
                let code = coerce_int(key, v)?;
                u16::try_from(code).map_err(|_| invalid(key, "a list of HTTP status codes", v))
            })
            .collect()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(key: &str, expected: &'static str, found: &Value) -> SettingsError {
    SettingsError::InvalidType {
        key: key.to_string(),
        expected,
        found: found.to_string(),
    }
}

fn coerce_bool(key: &str, value: &Value) -> Result<bool, SettingsError> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => n
            .as_f64()
            .map(|f| f.trunc() != 0.0)
            .ok_or_else(|| invalid(key, "a boolean", value)),
        Value::String(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("true") {
                Ok(true)
            } else if s.eq_ignore_ascii_case("false") {
                Ok(false)
            } else {
                s.parse::<i64>()
                    .map(|i| i != 0)
                    .map_err(|_| invalid(key, "a boolean", value))
            }
        }
        _ => Err(invalid(key, "a boolean", value)),
    }
}

fn coerce_int(key: &str, value: &Value) -> Result<i64, SettingsError> {
    match value {
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| invalid(key, "an integer", value)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i64))
                .map_err(|_| invalid(key, "an integer", value))
        }
        _ => Err(invalid(key, "an integer", value)),
    }
}

fn coerce_float(key: &str, value: &Value) -> Result<f64, SettingsError> {
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(key, "a number", value)),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid(key, "a number", value)),
        _ => Err(invalid(key, "a number", value)),
    }
}

fn coerce_list(key: &str, value: &Value) -> Result<Vec<Value>, SettingsError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Value::String(part.to_string()))
            .collect()),
        _ => Err(invalid(key, "a list", value)),
    }
}

fn coerce_map(key: &str, value: &Value) -> Result<Map<String, Value>, SettingsError> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(invalid(key, "a map", value)),
        },
        _ => Err(invalid(key, "a map", value)),
    }
}

fn default_settings() -> Map<String, Value> {
    let defaults = json!({
        CONCURRENT_REQUESTS: 16,
        CONCURRENT_REQUESTS_PER_DOMAIN: 8,
        DOWNLOAD_DELAY: 0.0,
        RANDOMIZE_DOWNLOAD_DELAY: true,
        DOWNLOAD_TIMEOUT: 180.0,
        DOWNLOAD_MAXSIZE: 1024u64 * 1024 * 1024,
        DOWNLOAD_HANDLERS: {},
        PIPELINE: {},
        PIPELINE_BASE: {
            "DuplicateFilterMiddleware": 100,
            "DefaultHeadersMiddleware": 400,
            "RetryMiddleware": 500,
            "RedirectMiddleware": 600,
            "HttpCacheMiddleware": 900,
        },
        DEFAULT_REQUEST_HEADERS: {
            "Accept": "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            "Accept-Language": "en",
        },
        USER_AGENT: concat!("spider-engine/", env!("CARGO_PKG_VERSION")),
        DUPEFILTER_CAPACITY: 1_000_000,
        RETRY_ENABLED: true,
        RETRY_TIMES: 2,
        RETRY_HTTP_CODES: [500, 502, 503, 504, 522, 524, 408, 429],
        RETRY_PRIORITY_ADJUST: -1,
        REDIRECT_ENABLED: true,
        REDIRECT_MAX_TIMES: 20,
        HTTPCACHE_ENABLED: false,
        HTTPCACHE_MAX_ENTRIES: 10_000,
        HTTPCACHE_IGNORE_HTTP_CODES: [],
        SHUTDOWN_TIMEOUT: 30.0,
        LOG_LEVEL: "info",
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
