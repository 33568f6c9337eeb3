use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Limits for upstream listeners (mock server and bridge).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Timeout for idle connections
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long a client with only errors is remembered
    #[serde(with = "humantime_serde")]
    pub error_timeout: Duration,
    /// Limits for specific IP addresses
    pub per_ip_limits: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 100,
            idle_timeout: Duration::from_secs(60),
            error_timeout: Duration::from_secs(300),
            per_ip_limits: Some(10),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections cannot be 0"));
        }

        if let Some(limit) = self.per_ip_limits {
            if limit == 0 {
                return Err(ConfigError::invalid("per_ip_limits cannot be 0"));
            }
            if limit > self.max_connections {
                return Err(ConfigError::invalid(format!(
                    "per_ip_limits ({}) cannot be greater than max_connections ({})",
                    limit, self.max_connections
                )));
            }
        }

        if self.idle_timeout.is_zero() {
            return Err(ConfigError::invalid("idle_timeout cannot be 0"));
        }

        Ok(())
    }
}
