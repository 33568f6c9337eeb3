use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::transport::Endpoint;

use super::{ConnectionConfig, DeviceConfig};

/// Mock-server engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where to listen: a TCP bind endpoint or one serial port.
    pub listen: Endpoint,

    /// Emulated device: register map, rules, faults, scripts.
    pub device: DeviceConfig,

    /// Upstream connection limits (TCP listeners).
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Per-session read timeout before an idle check.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Interval for the scripts' `on_periodic` hook.
    #[serde(default, with = "humantime_serde::option")]
    pub periodic_interval: Option<Duration>,
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.device.validate()?;
        if self.session_timeout.is_zero() {
            return Err(ConfigError::invalid("session_timeout cannot be 0"));
        }
        Ok(())
    }
}
