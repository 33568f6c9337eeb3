use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::transport::Endpoint;

use super::{BackoffConfig, ConnectionConfig, FaultConfig, ScriptConfig};

/// Bridge engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upstream side: where masters attach.
    pub upstream: Endpoint,

    /// Downstream side: the device or bus being bridged.
    pub downstream: Endpoint,

    /// Bound on one downstream exchange; expiry becomes exception 0x0B.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Per-session read timeout on the upstream side.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Capture file for the master↔bridge stream.
    #[serde(default)]
    pub pcap_upstream: Option<PathBuf>,

    /// Capture file for the bridge↔slave stream.
    #[serde(default)]
    pub pcap_downstream: Option<PathBuf>,

    /// Interval for the scripts' `on_periodic` hook.
    #[serde(default, with = "humantime_serde::option")]
    pub periodic_interval: Option<Duration>,

    /// Fault profile applied to relayed responses.
    #[serde(default)]
    pub faults: FaultConfig,

    /// Upstream connection limits (TCP listeners).
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Downstream reconnect backoff.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Bridge scripts, in pipeline order.
    #[serde(default)]
    pub scripts: Vec<ScriptConfig>,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        self.faults.validate()?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout cannot be 0"));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::invalid("session_timeout cannot be 0"));
        }
        if self.backoff.max_retries == 0 {
            return Err(ConfigError::invalid("backoff max_retries cannot be 0"));
        }
        Ok(())
    }
}
