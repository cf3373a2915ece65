use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use thiserror::Error;

pub const ENV_BIND_ADDR: &str = "KHOVAITON_API_BIND_ADDR";
pub const ENV_MAPPINGS_FILE: &str = "KHOVAITON_API_MAPPINGS_FILE";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Where mappings are persisted; `None` keeps them in memory only.
    pub mappings_file: Option<PathBuf>,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, ENV_BIND_ADDR, DEFAULT_BIND_ADDR);
        if !bind_addr.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "{ENV_BIND_ADDR} must be host:port, got {bind_addr}"
            )));
        }
        let mappings_file = optional_trimmed(&lookup, ENV_MAPPINGS_FILE).map(PathBuf::from);

        Ok(Self {
            bind_addr,
            mappings_file,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
