//! Configuration loading (spec.md §6): a YAML file at `bnc.yaml` by
//! default, following the teacher's `Config::load` / `validate` split and
//! its `config/{types,defaults,validation}` layout.

mod defaults;
mod types;
mod validation;

pub use types::{Config, ListenerConfig, LoggingConfig, StorageConfig, TlsListenerConfig};
pub use validation::validate;

use std::path::Path;
use thiserror::Error;

/// Errors loading or validating the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read config file {0}: {1}")]
    Read(String, std::io::Error),
    /// The file did not parse as valid YAML for this schema.
    #[error("could not parse config file {0}: {1}")]
    Parse(String, serde_yaml::Error),
    /// The config parsed but failed semantic validation.
    #[error("{0} validation error(s): {1}")]
    Invalid(usize, String),
}

impl Config {
    /// Load and parse (but do not validate) the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read(path_str.clone(), e))?;
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(path_str, e))
    }

    /// Load, then validate, returning a single combined error on failure.
    pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let config = Config::load(path)?;
        if let Err(errors) = validate(&config) {
            let joined = errors.join("; ");
            return Err(ConfigError::Invalid(errors.len(), joined));
        }
        Ok(config)
    }
}
