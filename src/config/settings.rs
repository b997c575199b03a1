//! Process-wide adapter settings, loaded from an optional file plus
//! `MQBRIDGE_`-prefixed environment overrides.

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::config::SourcePolicy;
use crate::error::{BridgeError, Result};

/// Top-level settings shared by every connection source in the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    #[serde(default)]
    pub source: SourcePolicy,

    /// Graceful shutdown budget for listener workers, in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Default log filter directive, overridable through `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            source: SourcePolicy::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            log_filter: default_log_filter(),
        }
    }
}

impl AdapterSettings {
    /// Load settings from `mqbridge.toml` (optional) with environment
    /// overrides, e.g. `MQBRIDGE_SOURCE__CONNECTIONS_ARE_POOLED=true`.
    pub fn load() -> Result<Self> {
        Self::load_from("mqbridge")
    }

    pub fn load_from(basename: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name(basename).required(false))
            .add_source(Environment::with_prefix("MQBRIDGE").separator("__"))
            .build()
            .map_err(|e| BridgeError::configuration("settings", e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| BridgeError::configuration("settings", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AdapterSettings::default();
        assert!(!settings.source.connections_are_pooled);
        assert!(settings.source.cleanup_on_close);
        assert_eq!(settings.shutdown_timeout_ms, 30_000);
        assert_eq!(settings.log_filter, "info");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let settings = AdapterSettings::load_from("nonexistent-settings-file")
            .expect("missing file should fall back to defaults");
        assert_eq!(settings.shutdown_timeout_ms, 30_000);
    }
}
