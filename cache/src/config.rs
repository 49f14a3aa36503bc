//! Cache configuration.

use serde::{Deserialize, Serialize};
use std::env;

/// Tunables of the cache, loadable from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Buffer single-record fetches of one tick and hand them to the
    /// adapter's grouping strategy
    pub coalesce_find_requests: bool,
    /// Destroy unloaded records no loaded record references at the end of
    /// each tick
    pub sweep_orphans: bool,
    /// Largest batch sent through the bulk fetch path
    pub max_find_many: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            coalesce_find_requests: true,
            sweep_orphans: true,
            max_find_many: None,
        }
    }
}

impl CacheConfig {
    /// Load configuration from `CARRY_*` environment variables, falling back
    /// to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let coalesce_find_requests = match env::var("CARRY_COALESCE_FIND_REQUESTS") {
            Ok(value) => parse_flag("CARRY_COALESCE_FIND_REQUESTS", &value)?,
            Err(_) => defaults.coalesce_find_requests,
        };

        let sweep_orphans = match env::var("CARRY_SWEEP_ORPHANS") {
            Ok(value) => parse_flag("CARRY_SWEEP_ORPHANS", &value)?,
            Err(_) => defaults.sweep_orphans,
        };

        let max_find_many = match env::var("CARRY_MAX_FIND_MANY") {
            Ok(value) => {
                let max: usize = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidMaxFindMany(value.clone()))?;
                if max == 0 {
                    return Err(ConfigError::InvalidMaxFindMany(value));
                }
                Some(max)
            }
            Err(_) => defaults.max_find_many,
        };

        Ok(Self {
            coalesce_find_requests,
            sweep_orphans,
            max_find_many,
        })
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a boolean, got '{value}'")]
    InvalidFlag { name: &'static str, value: String },

    #[error("CARRY_MAX_FIND_MANY must be a positive integer, got '{0}'")]
    InvalidMaxFindMany(String),
}
