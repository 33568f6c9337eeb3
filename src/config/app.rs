use std::path::PathBuf;

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

use super::{BridgeConfig, LoggingConfig, MockServerConfig};

/// Top-level application configuration for the `umdt` binary.
///
/// Loaded from a YAML/JSON file with `UMDT_*` environment overrides layered
/// on top (e.g. `UMDT_LOGGING__LEVEL=debug`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Mock server engine, if this process runs one.
    pub server: Option<MockServerConfig>,

    /// Bridge engine, if this process runs one.
    pub bridge: Option<BridgeConfig>,
}

impl Config {
    /// Environment variable prefix
    const ENV_PREFIX: &'static str = "UMDT";

    /// Load configuration from a specific file with env overrides.
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging.validate()?;
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(bridge) = &self.bridge {
            bridge.validate()?;
        }
        Ok(())
    }
}
