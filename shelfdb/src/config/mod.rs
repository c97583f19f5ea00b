use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Connection-level settings applied to every connection a store opens.
///
/// Usually loaded from a small YAML file next to the database:
///
/// ```yaml
/// busy_timeout_ms: 2000
/// synchronous: full
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub synchronous: SynchronousMode,
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: i64,
    /// Consumer name used when an operation is given no transaction or connection.
    #[serde(default)]
    pub default_consumer: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronousMode {
    Off,
    #[default]
    Normal,
    Full,
}

impl SynchronousMode {
    pub(crate) fn pragma_value(self) -> &'static str {
        match self {
            SynchronousMode::Off => "OFF",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Full => "FULL",
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_cache_size_kib() -> i64 {
    2048
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            busy_timeout_ms: default_busy_timeout_ms(),
            synchronous: SynchronousMode::default(),
            cache_size_kib: default_cache_size_kib(),
            default_consumer: String::new(),
        }
    }
}

impl StoreConfig {
    /// Parse a YAML config file into a StoreConfig
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse a YAML string into a StoreConfig. An empty document yields the defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(StoreConfig::default());
        }
        let config: StoreConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }
}
