use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Failed to load {path}: {detail}")]
    Load { path: PathBuf, detail: String },
}

impl ConfigError {
    pub fn invalid(details: impl Into<String>) -> Self {
        Self::Invalid(details.into())
    }

    pub fn load(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Invalid(err.to_string())
    }
}
